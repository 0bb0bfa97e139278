use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use batchscribe::cli::commands::App;
use batchscribe::cli::{Cli, Commands};
use batchscribe::config::AppConfig;
use batchscribe::utils;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let default_filter = if cli.verbose {
        "batchscribe=debug"
    } else {
        "batchscribe=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let (mut config, config_path) = AppConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = Some(dir);
    }

    if matches!(
        cli.command,
        Commands::Run { .. } | Commands::Resume { .. } | Commands::Retry { .. }
    ) {
        let missing_deps = utils::check_dependencies(&config).await;
        if !missing_deps.is_empty() {
            eprintln!("⚠️  Dependency check warnings:");
            for dep in missing_deps {
                eprintln!("   • {}", dep);
            }
        }
    }

    let app = App::new(config, config_path, cli.quiet)?;
    app.prepare();

    let result = app.execute(cli.command).await;
    app.shutdown().await;
    result
}
