//! SMTP delivery. One attempt, no retry.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::info;

use crate::{EmailChannel, EmailTransport, Event, NotifyError};

const SMTP_TIMEOUT: Duration = Duration::from_secs(60);

fn mailbox(address: &str) -> Result<Mailbox, NotifyError> {
    address
        .parse()
        .map_err(|e| NotifyError::Config(format!("invalid email address '{}': {}", address, e)))
}

/// Build the message: subject line, summary as the body, log attached.
pub async fn build_message(
    channel: &EmailChannel,
    event: &Event,
    attachment: Option<&Path>,
) -> Result<Message, NotifyError> {
    let mut builder = Message::builder()
        .from(mailbox(&channel.from)?)
        .subject(event.subject());
    for to in &channel.to {
        builder = builder.to(mailbox(to)?);
    }

    let body = SinglePart::plain(event.summary.clone());

    let message = match attachment {
        Some(path) => {
            let bytes = tokio::fs::read(path).await?;
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "backup.log".to_string());
            let content_type = ContentType::parse("application/octet-stream")
                .map_err(|e| NotifyError::Email(e.to_string()))?;

            builder.multipart(
                MultiPart::mixed()
                    .singlepart(body)
                    .singlepart(Attachment::new(filename).body(bytes, content_type)),
            )
        }
        None => builder.singlepart(body),
    };

    message.map_err(|e| NotifyError::Email(format!("failed to build message: {}", e)))
}

/// Sends through the channel's SMTP server, authenticating as the sender.
#[derive(Debug, Clone)]
pub struct SmtpMailer {
    timeout: Duration,
}

impl Default for SmtpMailer {
    fn default() -> Self {
        Self {
            timeout: SMTP_TIMEOUT,
        }
    }
}

impl SmtpMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl EmailTransport for SmtpMailer {
    async fn send(
        &self,
        channel: &EmailChannel,
        event: &Event,
        attachment: Option<&Path>,
    ) -> Result<(), NotifyError> {
        let endpoint = channel.endpoint()?;
        let message = build_message(channel, event, attachment).await?;

        let builder = if endpoint.ssl {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&endpoint.server)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&endpoint.server)
        }
        .map_err(|e| NotifyError::Email(format!("{}: {}", endpoint.server, e)))?;

        let transport = builder
            .port(endpoint.port)
            .credentials(Credentials::new(
                channel.from.clone(),
                channel.password.clone(),
            ))
            .timeout(Some(self.timeout))
            .build();

        transport.send(message).await.map_err(|e| {
            NotifyError::Email(format!("{}:{}: {}", endpoint.server, endpoint.port, e))
        })?;

        info!(server = %endpoint.server, recipients = channel.to.len(), "email sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Outcome, SmtpConfig};
    use chrono::{Local, TimeZone};

    fn channel() -> EmailChannel {
        EmailChannel {
            id: 2,
            from: "backups@gmail.com".to_string(),
            to: vec!["ops@example.org".to_string(), "me@example.org".to_string()],
            password: "app-password".to_string(),
            smtp: None,
        }
    }

    fn event() -> Event {
        Event::new("home", Outcome::Success, "SUCCESS\nExit    : 0")
            .at(Local.with_ymd_and_hms(2024, 5, 17, 3, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn test_message_headers_and_body() {
        let message = build_message(&channel(), &event(), None).await.unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();

        assert!(raw.contains("From: backups@gmail.com"));
        assert!(raw.contains("To: ops@example.org, me@example.org"));
        assert!(raw.contains("Subject: [Backup: home] OK (2024-05-17 03:00)"));
        assert!(raw.contains("Exit    : 0"));
    }

    #[tokio::test]
    async fn test_message_attaches_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("home-20240517-030000.log");
        std::fs::write(&log, "Exit code: 0\n").unwrap();

        let message = build_message(&channel(), &event(), Some(&log)).await.unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();

        assert!(raw.contains("multipart/mixed"));
        assert!(raw.contains("filename=\"home-20240517-030000.log\""));
    }

    #[tokio::test]
    async fn test_missing_attachment_is_io_error() {
        let err = build_message(&channel(), &event(), Some(Path::new("/nonexistent.log")))
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Io(_)));
    }

    #[tokio::test]
    async fn test_unknown_provider_fails_before_connecting() {
        let mut email = channel();
        email.from = "backups@corp.example".to_string();

        let err = SmtpMailer::new().send(&email, &event(), None).await.unwrap_err();
        assert!(matches!(err, NotifyError::Config(_)));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_email_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut email = channel();
        email.smtp = Some(SmtpConfig {
            server: "127.0.0.1".to_string(),
            port: Some(port),
            ssl: false,
        });

        let err = SmtpMailer::new()
            .with_timeout(Duration::from_secs(5))
            .send(&email, &event(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Email(_)));
    }
}
