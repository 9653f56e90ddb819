//! Notification channel records, as they appear in a plan's `notification` list.

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{NotifyError, Outcome};

/// URL prefix every Discord webhook must start with.
pub const DISCORD_WEBHOOK_PREFIX: &str = "https://discord.com/api/webhooks/";

/// Attempts made when a webhook does not set `max_retries`.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// SMTP settings inferred from the sender's domain: (domain, server, port, implicit TLS).
pub const SMTP_PROVIDERS: &[(&str, &str, u16, bool)] = &[
    ("gmail.com", "smtp.gmail.com", 587, false),
    ("outlook.com", "smtp.office365.com", 587, false),
    ("yahoo.com", "smtp.mail.yahoo.com", 465, true),
    ("icloud.com", "smtp.mail.me.com", 587, false),
];

/// One configured delivery channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Channel {
    Email(EmailChannel),
    Webhook(WebhookChannel),
}

impl Channel {
    pub fn id(&self) -> u32 {
        match self {
            Channel::Email(email) => email.id,
            Channel::Webhook(webhook) => webhook.id,
        }
    }

    /// Human-readable label for reports.
    pub fn label(&self) -> String {
        match self {
            Channel::Email(email) => format!("email to {}", email.to.join(", ")),
            Channel::Webhook(webhook) => format!("{} webhook '{}'", webhook.kind, webhook.name),
        }
    }

    pub fn validate(&self) -> Result<(), NotifyError> {
        match self {
            Channel::Email(email) => email.validate(),
            Channel::Webhook(webhook) => webhook.validate(),
        }
    }
}

/// Validate a plan's whole channel list.
pub fn validate_channels(channels: &[Channel]) -> Result<(), NotifyError> {
    let mut emails = 0;
    for channel in channels {
        channel.validate()?;
        if matches!(channel, Channel::Email(_)) {
            emails += 1;
        }
    }

    if emails > 1 {
        return Err(NotifyError::Config(format!(
            "at most one email channel is allowed, found {}",
            emails
        )));
    }

    Ok(())
}

/// Which webhook flavour to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookKind {
    Discord,
    Generic,
}

impl std::fmt::Display for WebhookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebhookKind::Discord => f.write_str("discord"),
            WebhookKind::Generic => f.write_str("generic"),
        }
    }
}

/// An HTTP endpoint notified on subscribed outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookChannel {
    #[serde(default)]
    pub id: u32,
    #[serde(alias = "webhook_type")]
    pub kind: WebhookKind,
    pub name: String,
    pub url: String,
    pub events: Vec<Outcome>,
    /// Response timeout such as `"10s"`, `"1.5e3ms"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl WebhookChannel {
    /// Whether this channel wants to hear about `outcome`.
    pub fn subscribed(&self, outcome: Outcome) -> bool {
        self.events.contains(&outcome)
    }

    /// Number of delivery attempts. Always at least one.
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// The parsed response timeout, if any.
    pub fn timeout(&self) -> Result<Option<Duration>, NotifyError> {
        self.timeout.as_deref().map(parse_timeout).transpose()
    }

    pub fn validate(&self) -> Result<(), NotifyError> {
        if self.name.trim().is_empty() {
            return Err(NotifyError::Config("webhook name cannot be empty".to_string()));
        }

        let url = reqwest::Url::parse(&self.url).map_err(|e| {
            NotifyError::Config(format!("webhook '{}': invalid url '{}': {}", self.name, self.url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(NotifyError::Config(format!(
                "webhook '{}': url must be http or https",
                self.name
            )));
        }

        if self.kind == WebhookKind::Discord && !self.url.starts_with(DISCORD_WEBHOOK_PREFIX) {
            return Err(NotifyError::Config(format!(
                "webhook '{}': for webhook type 'discord' a URL starting with '{}' is expected",
                self.name, DISCORD_WEBHOOK_PREFIX
            )));
        }

        if self.events.is_empty() {
            return Err(NotifyError::Config(format!(
                "webhook '{}': subscribe to at least one event",
                self.name
            )));
        }

        self.timeout()
            .map_err(|e| NotifyError::Config(format!("webhook '{}': {}", self.name, e)))?;

        for (name, value) in &self.headers {
            let valid = reqwest::header::HeaderName::from_bytes(name.as_bytes()).is_ok()
                && reqwest::header::HeaderValue::from_str(value).is_ok();
            if !valid {
                return Err(NotifyError::Config(format!(
                    "webhook '{}': invalid header '{}'",
                    self.name, name
                )));
            }
        }

        Ok(())
    }
}

fn timeout_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)(?:\.(\d+))?(?:e(\d+))?(s|ms|us)$").unwrap())
}

/// Parse a timeout string: `<int>[.<frac>][e<exp>](s|ms|us)`.
pub fn parse_timeout(raw: &str) -> Result<Duration, NotifyError> {
    let invalid = || NotifyError::Config(format!("incorrect formatting for timeout '{}'", raw));

    let caps = timeout_regex().captures(raw).ok_or_else(invalid)?;

    let mut value: f64 = caps[1].parse().map_err(|_| invalid())?;
    if let Some(frac) = caps.get(2) {
        let digits: f64 = frac.as_str().parse().map_err(|_| invalid())?;
        value += digits / 10f64.powi(frac.as_str().len() as i32);
    }
    if let Some(exp) = caps.get(3) {
        let exp: i32 = exp.as_str().parse().map_err(|_| invalid())?;
        value *= 10f64.powi(exp);
    }

    let seconds = match &caps[4] {
        "s" => value,
        "ms" => value / 1e3,
        _ => value / 1e6,
    };

    if seconds <= 0.0 {
        return Err(NotifyError::Config(format!(
            "timeout '{}' must be greater than zero",
            raw
        )));
    }

    Duration::try_from_secs_f64(seconds).map_err(|_| invalid())
}

/// SMTP overrides for an email channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Implicit TLS. STARTTLS is used otherwise.
    #[serde(default)]
    pub ssl: bool,
}

/// A fully resolved SMTP server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpEndpoint {
    pub server: String,
    pub port: u16,
    pub ssl: bool,
}

/// Mail sent after every run, whatever the outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailChannel {
    #[serde(default)]
    pub id: u32,
    pub from: String,
    pub to: Vec<String>,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp: Option<SmtpConfig>,
}

impl EmailChannel {
    /// The SMTP server to use, inferred from the sender domain when not given.
    pub fn endpoint(&self) -> Result<SmtpEndpoint, NotifyError> {
        if let Some(smtp) = &self.smtp {
            let port = smtp.port.unwrap_or(if smtp.ssl { 465 } else { 587 });
            return Ok(SmtpEndpoint {
                server: smtp.server.clone(),
                port,
                ssl: smtp.ssl,
            });
        }

        let domain = self.from.rsplit('@').next().unwrap_or_default();
        SMTP_PROVIDERS
            .iter()
            .find(|(provider, ..)| provider.eq_ignore_ascii_case(domain))
            .map(|(_, server, port, ssl)| SmtpEndpoint {
                server: server.to_string(),
                port: *port,
                ssl: *ssl,
            })
            .ok_or_else(|| {
                NotifyError::Config(format!(
                    "no SMTP defaults for '{}'; set smtp.server and smtp.port explicitly",
                    domain
                ))
            })
    }

    pub fn validate(&self) -> Result<(), NotifyError> {
        check_address(&self.from)?;
        if self.to.is_empty() {
            return Err(NotifyError::Config("email needs at least one recipient".to_string()));
        }
        for to in &self.to {
            check_address(to)?;
        }

        let endpoint = self.endpoint()?;
        if endpoint.server.trim().is_empty() {
            return Err(NotifyError::Config("smtp.server cannot be empty".to_string()));
        }
        if endpoint.port == 0 {
            return Err(NotifyError::Config("smtp.port must be between 1 and 65535".to_string()));
        }

        Ok(())
    }
}

fn check_address(address: &str) -> Result<(), NotifyError> {
    address
        .parse::<lettre::Address>()
        .map(|_| ())
        .map_err(|e| NotifyError::Config(format!("invalid email address '{}': {}", address, e)))
}
