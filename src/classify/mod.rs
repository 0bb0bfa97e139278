//! Error classification for the automatic retry decision.
//!
//! Collaborators report failures as free text; this module maps that text to a
//! category and decides whether one more attempt is worth it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Category of a failure, used for retry eligibility and backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    None,
    /// Timeouts and connection errors
    RetryableNetwork,
    /// HTTP 429
    RetryableRateLimit,
    /// HTTP 5xx
    RetryableServer,
    /// HTTP 401/403, bad credentials
    NonRetryableAuth,
    /// Missing or oversized input
    NonRetryableFile,
    /// Corrupted or unsupported media
    NonRetryableConversion,
    /// Missing tools, permissions
    NonRetryableConfig,
}

impl ErrorCategory {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::RetryableNetwork
                | ErrorCategory::RetryableRateLimit
                | ErrorCategory::RetryableServer
        )
    }

    fn base_delay_secs(&self) -> f64 {
        match self {
            ErrorCategory::RetryableRateLimit => 5.0,
            ErrorCategory::RetryableNetwork => 2.0,
            ErrorCategory::RetryableServer => 3.0,
            _ => 2.0,
        }
    }
}

const RATE_LIMIT_PATTERNS: &[&str] = &["rate limit", "too many requests", "429"];

const NETWORK_PATTERNS: &[&str] = &[
    "timeout",
    "connection error",
    "connection refused",
    "network unreachable",
    "connection reset",
    "operation took too long",
];

const SERVER_PATTERNS: &[&str] = &[
    "500",
    "502",
    "503",
    "504",
    "internal server error",
    "service unavailable",
    "bad gateway",
    "gateway timeout",
];

const AUTH_PATTERNS: &[&str] = &[
    "invalid api key",
    "access denied",
    "unauthorized",
    "401",
    "403",
    "forbidden",
];

const FILE_PATTERNS: &[&str] = &[
    "file does not exist",
    "file not found",
    "file too large",
    "max 2gb",
    "no such file",
];

const CONVERSION_PATTERNS: &[&str] = &[
    "corrupted",
    "unsupported",
    "invalid or corrupted",
    "does not contain audio",
    "does not contain any stream",
    "invalid data found",
];

const CONFIG_PATTERNS: &[&str] = &[
    "ffmpeg not found",
    "please reinstall",
    "permission denied",
    "cannot access file",
];

/// Checked in order, first match wins
const RULES: &[(&[&str], ErrorCategory)] = &[
    (RATE_LIMIT_PATTERNS, ErrorCategory::RetryableRateLimit),
    (NETWORK_PATTERNS, ErrorCategory::RetryableNetwork),
    (SERVER_PATTERNS, ErrorCategory::RetryableServer),
    (AUTH_PATTERNS, ErrorCategory::NonRetryableAuth),
    (FILE_PATTERNS, ErrorCategory::NonRetryableFile),
    (CONVERSION_PATTERNS, ErrorCategory::NonRetryableConversion),
    (CONFIG_PATTERNS, ErrorCategory::NonRetryableConfig),
];

/// Classify an error message into a category and a retry decision.
///
/// Unrecognized text is treated as a network error so the file gets one more attempt.
pub fn classify(message: &str) -> (ErrorCategory, bool) {
    if message.is_empty() {
        return (ErrorCategory::None, false);
    }

    let lower = message.to_lowercase();
    let category = RULES
        .iter()
        .find(|(patterns, _)| patterns.iter().any(|p| lower.contains(p)))
        .map(|(_, category)| *category)
        .unwrap_or(ErrorCategory::RetryableNetwork);

    (category, category.is_retryable())
}

pub fn is_retryable(message: &str) -> bool {
    classify(message).1
}

/// Delay before retry `attempt` (1-based): base delay doubled per attempt
pub fn retry_delay(category: ErrorCategory, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(30) as i32;
    Duration::from_secs_f64(category.base_delay_secs() * 2f64.powi(exponent))
}
