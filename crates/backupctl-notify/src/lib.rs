//! Outcome notifications for backupctl runs.
//!
//! A finished run becomes an [`Event`]. The [`Dispatcher`] sends it to every
//! subscribed webhook (with bounded retry) and then to the plan's single
//! email channel.

pub mod channel;
pub mod dispatch;
mod email;
mod error;
mod event;
pub mod webhook;

pub use channel::{
    Channel, DEFAULT_MAX_RETRIES, DISCORD_WEBHOOK_PREFIX, EmailChannel, SMTP_PROVIDERS,
    SmtpConfig, SmtpEndpoint, WebhookChannel, WebhookKind, parse_timeout, validate_channels,
};
pub use dispatch::{DispatchReport, Dispatcher, EmailTransport, FAILURES_HEADING, WebhookTransport};
pub use email::{SmtpMailer, build_message};
pub use error::NotifyError;
pub use event::{Event, Outcome};
pub use webhook::{Attempt, Backoff, Delivery, RETRYABLE_STATUSES, Step, WebhookClient, next_step};
