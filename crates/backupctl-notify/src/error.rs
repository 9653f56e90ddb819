//! Error types for notification delivery.

use thiserror::Error;

/// Errors that can occur when configuring or sending notifications.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// A channel record is malformed or inconsistent.
    #[error("invalid notification config: {0}")]
    Config(String),

    /// Webhook delivery failed.
    #[error("webhook delivery failed: {0}")]
    Transport(String),

    /// Email delivery failed.
    #[error("email delivery failed: {0}")]
    Email(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
