//! Webhook delivery with bounded retry.
//!
//! Each delivery walks `ATTEMPT(1..=n)` and ends in either `Delivered` or
//! `Exhausted`. Retryable statuses and network failures back off and try
//! again; anything else ends the delivery at once. Errors never escape as
//! `Err`: the caller always gets a [`Delivery`].

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Serialize;
use tracing::{debug, warn};

use crate::{Event, NotifyError, Outcome, WebhookChannel, WebhookKind, WebhookTransport};

/// Statuses worth another attempt.
pub const RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Ceiling for the computed backoff, in backoff units.
const MAX_BACKOFF_UNITS: u32 = 30;

/// Discord rejects messages longer than this many characters.
const DISCORD_CONTENT_LIMIT: usize = 2000;

/// Username shown on Discord messages.
const DISCORD_USERNAME: &str = "backupctl";

/// How a webhook delivery ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered { attempts: u32 },
    Exhausted { attempts: u32, error: String },
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Delivered { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Delivery::Delivered { attempts } | Delivery::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Delivery::Delivered { .. } => None,
            Delivery::Exhausted { error, .. } => Some(error),
        }
    }
}

/// What one request produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    /// The server answered.
    Response {
        status: u16,
        reason: String,
        /// Seconds from a numeric `Retry-After` header.
        retry_after: Option<u64>,
    },
    /// Timeout or connection failure.
    Network(String),
    /// Any other client-side failure.
    Fatal(String),
}

/// What to do after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Finish(Delivery),
    Retry(Duration),
}

/// Exponential backoff: `unit * min(2^attempt, 30)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    unit: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            unit: Duration::from_secs(1),
        }
    }
}

impl Backoff {
    /// Backoff measured in `unit` instead of seconds.
    pub fn with_unit(unit: Duration) -> Self {
        Self { unit }
    }

    /// Delay after the given 1-based attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let units = 2u32
            .checked_pow(attempt)
            .unwrap_or(u32::MAX)
            .min(MAX_BACKOFF_UNITS);
        self.unit * units
    }

    /// Server-requested delay, in the same units.
    fn retry_after(&self, secs: u64) -> Duration {
        self.unit.saturating_mul(u32::try_from(secs).unwrap_or(u32::MAX))
    }
}

/// Decide what follows `attempt` of `max_attempts`.
pub fn next_step(attempt: u32, max_attempts: u32, result: &Attempt, backoff: &Backoff) -> Step {
    let last = attempt >= max_attempts;

    match result {
        Attempt::Response { status, .. } if *status < 400 => {
            Step::Finish(Delivery::Delivered { attempts: attempt })
        }
        Attempt::Response {
            status,
            reason,
            retry_after,
        } => {
            let error = format!("Webhook request failed with HTTP {}: {}", status, reason);
            if !RETRYABLE_STATUSES.contains(status) || last {
                return Step::Finish(Delivery::Exhausted {
                    attempts: attempt,
                    error,
                });
            }

            let delay = match (status, retry_after) {
                (429, Some(secs)) => backoff.retry_after(*secs),
                _ => backoff.delay(attempt),
            };
            Step::Retry(delay)
        }
        Attempt::Network(e) => {
            if last {
                Step::Finish(Delivery::Exhausted {
                    attempts: attempt,
                    error: format!(
                        "Network error contacting webhook (attempt {}/{}): {}",
                        attempt, max_attempts, e
                    ),
                })
            } else {
                Step::Retry(backoff.delay(attempt))
            }
        }
        Attempt::Fatal(e) => Step::Finish(Delivery::Exhausted {
            attempts: attempt,
            error: format!("Unexpected error while sending webhook: {}", e),
        }),
    }
}

#[derive(Serialize)]
struct DiscordPayload<'a> {
    content: String,
    username: &'a str,
}

#[derive(Serialize)]
struct GenericPayload<'a> {
    job: &'a str,
    outcome: Outcome,
    subject: String,
    summary: &'a str,
}

struct LogFile {
    name: String,
    bytes: Vec<u8>,
}

fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// HTTP client for webhook channels.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    http: Client,
    backoff: Backoff,
}

impl WebhookClient {
    pub fn new() -> Result<Self, NotifyError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("backupctl/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| NotifyError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            backoff: Backoff::default(),
        })
    }

    /// Use a different backoff schedule.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn request(
        &self,
        channel: &WebhookChannel,
        event: &Event,
        timeout: Option<Duration>,
        log: Option<&LogFile>,
    ) -> Result<RequestBuilder, reqwest::Error> {
        let mut request = self.http.post(&channel.url);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        for (name, value) in &channel.headers {
            request = request.header(name, value);
        }

        match channel.kind {
            WebhookKind::Discord => {
                let payload = DiscordPayload {
                    content: truncate_chars(&event.content(), DISCORD_CONTENT_LIMIT),
                    username: DISCORD_USERNAME,
                };

                let Some(log) = log else {
                    return Ok(request.json(&payload));
                };

                let payload_json = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".into());
                let form = Form::new()
                    .part(
                        "payload_json",
                        Part::text(payload_json).mime_str("application/json")?,
                    )
                    .part(
                        "files[0]",
                        Part::bytes(log.bytes.clone())
                            .file_name(log.name.clone())
                            .mime_str("text/plain")?,
                    );
                Ok(request.multipart(form))
            }
            WebhookKind::Generic => Ok(request.json(&GenericPayload {
                job: &event.job,
                outcome: event.outcome,
                subject: event.subject(),
                summary: &event.summary,
            })),
        }
    }

    async fn attempt(
        &self,
        channel: &WebhookChannel,
        event: &Event,
        timeout: Option<Duration>,
        log: Option<&LogFile>,
    ) -> Attempt {
        let request = match self.request(channel, event, timeout, log) {
            Ok(request) => request,
            Err(e) => return Attempt::Fatal(e.to_string()),
        };

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let retry_after = if status == StatusCode::TOO_MANY_REQUESTS {
                    response
                        .headers()
                        .get("Retry-After")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.trim().parse().ok())
                } else {
                    None
                };

                Attempt::Response {
                    status: status.as_u16(),
                    reason: status.canonical_reason().unwrap_or("").to_string(),
                    retry_after,
                }
            }
            Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                Attempt::Network(e.to_string())
            }
            Err(e) => Attempt::Fatal(e.to_string()),
        }
    }

    /// Deliver `event` to `channel`, retrying as configured.
    #[tracing::instrument(skip_all, fields(webhook = %channel.name, kind = %channel.kind))]
    pub async fn deliver(
        &self,
        channel: &WebhookChannel,
        event: &Event,
        attachment: Option<&Path>,
    ) -> Delivery {
        let timeout = match channel.timeout() {
            Ok(timeout) => timeout,
            Err(e) => {
                return Delivery::Exhausted {
                    attempts: 0,
                    error: e.to_string(),
                };
            }
        };

        // Generic webhooks do not upload the log
        let log = match (channel.kind, attachment) {
            (WebhookKind::Discord, Some(path)) => match tokio::fs::read(path).await {
                Ok(bytes) => Some(LogFile {
                    name: path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "backup.log".to_string()),
                    bytes,
                }),
                Err(e) => {
                    return Delivery::Exhausted {
                        attempts: 0,
                        error: format!("failed to read attachment {}: {}", path.display(), e),
                    };
                }
            },
            _ => None,
        };

        let max_attempts = channel.attempts();
        let mut attempt = 1;
        loop {
            let result = self.attempt(channel, event, timeout, log.as_ref()).await;
            match next_step(attempt, max_attempts, &result, &self.backoff) {
                Step::Finish(delivery) => {
                    match &delivery {
                        Delivery::Delivered { attempts } => debug!(attempts, "webhook delivered"),
                        Delivery::Exhausted { attempts, error } => {
                            warn!(attempts, error = %error, "webhook delivery failed")
                        }
                    }
                    return delivery;
                }
                Step::Retry(delay) => {
                    warn!(
                        attempt,
                        max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        result = ?result,
                        "transient webhook failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl WebhookTransport for WebhookClient {
    async fn deliver(
        &self,
        channel: &WebhookChannel,
        event: &Event,
        attachment: Option<&Path>,
    ) -> Delivery {
        WebhookClient::deliver(self, channel, event, attachment).await
    }
}
