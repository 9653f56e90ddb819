//! Routing a finished run to its channels.

use std::path::Path;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::{
    Channel, Delivery, EmailChannel, Event, NotifyError, SmtpMailer, WebhookChannel,
    WebhookClient,
};

/// Heading of the section appended to the run log when webhooks failed.
pub const FAILURES_HEADING: &str = "---------- NOTIFICATION SYSTEM FAILURES ----------";

/// Sends one event to one webhook, retrying as the channel allows.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn deliver(
        &self,
        channel: &WebhookChannel,
        event: &Event,
        attachment: Option<&Path>,
    ) -> Delivery;
}

/// Sends one event by email, once.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(
        &self,
        channel: &EmailChannel,
        event: &Event,
        attachment: Option<&Path>,
    ) -> Result<(), NotifyError>;
}

/// What happened to each channel.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Webhooks that were invoked, by name, with their outcome.
    pub webhooks: Vec<(String, Delivery)>,
    /// Webhooks not subscribed to this outcome.
    pub skipped: Vec<String>,
    pub email_sent: bool,
}

impl DispatchReport {
    /// `(webhook name, error)` for every failed delivery.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.webhooks
            .iter()
            .filter_map(|(name, delivery)| delivery.error().map(|e| (name.as_str(), e)))
    }

    pub fn all_delivered(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Fans an event out to webhooks, then to the email channel.
pub struct Dispatcher<W = WebhookClient, E = SmtpMailer> {
    webhook: W,
    email: E,
}

impl Dispatcher {
    /// Real HTTP and SMTP transports.
    pub fn standard() -> Result<Self, NotifyError> {
        Ok(Self::new(WebhookClient::new()?, SmtpMailer::new()))
    }
}

impl<W: WebhookTransport, E: EmailTransport> Dispatcher<W, E> {
    pub fn new(webhook: W, email: E) -> Self {
        Self { webhook, email }
    }

    /// Deliver `event` to every channel that wants it.
    ///
    /// Webhooks go first, one after another; a failing webhook does not stop
    /// the others. Their failures are appended to `log_file`, then the email
    /// channel (if any) is sent with the log attached. An email failure is
    /// returned as an error.
    #[tracing::instrument(skip_all, fields(job = %event.job, outcome = %event.outcome))]
    pub async fn dispatch(
        &self,
        event: &Event,
        channels: &[Channel],
        log_file: Option<&Path>,
    ) -> Result<DispatchReport, NotifyError> {
        let mut report = DispatchReport::default();
        let mut email = None;

        for channel in channels {
            match channel {
                Channel::Webhook(webhook) => {
                    if !webhook.subscribed(event.outcome) {
                        debug!(webhook = %webhook.name, "not subscribed to this outcome");
                        report.skipped.push(webhook.name.clone());
                        continue;
                    }
                    let delivery = self.webhook.deliver(webhook, event, log_file).await;
                    report.webhooks.push((webhook.name.clone(), delivery));
                }
                Channel::Email(channel) => {
                    if email.is_some() {
                        warn!("more than one email channel configured, using the first");
                        continue;
                    }
                    email = Some(channel);
                }
            }
        }

        if let Some(path) = log_file {
            if !report.all_delivered() {
                if let Err(e) = append_failures(path, &report).await {
                    warn!(path = %path.display(), error = %e, "could not record webhook failures");
                }
            }
        }

        if let Some(channel) = email {
            self.email.send(channel, event, log_file).await?;
            report.email_sent = true;
        }

        info!(
            webhooks = report.webhooks.len(),
            failed = report.failures().count(),
            email = report.email_sent,
            "notifications dispatched"
        );
        Ok(report)
    }
}

async fn append_failures(path: &Path, report: &DispatchReport) -> Result<(), NotifyError> {
    let mut section = format!("\n{}\n", FAILURES_HEADING);
    for (name, error) in report.failures() {
        section.push_str(&format!(
            "[NOTIFICATION SYS: {}] Failed with message: {}\n",
            name, error
        ));
    }

    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .await?;
    file.write_all(section.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Outcome, WebhookKind};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Records calls; fails webhooks whose name starts with "bad".
    #[derive(Default)]
    struct FakeWebhooks {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WebhookTransport for FakeWebhooks {
        async fn deliver(
            &self,
            channel: &WebhookChannel,
            _event: &Event,
            _attachment: Option<&Path>,
        ) -> Delivery {
            self.calls.lock().unwrap().push(channel.name.clone());
            if channel.name.starts_with("bad") {
                Delivery::Exhausted {
                    attempts: 3,
                    error: "Webhook request failed with HTTP 500: Internal Server Error"
                        .to_string(),
                }
            } else {
                Delivery::Delivered { attempts: 1 }
            }
        }
    }

    /// Records each email with the log content it would attach.
    #[derive(Default)]
    struct FakeMailer {
        sent: Mutex<Vec<(String, Option<String>)>>,
        fail: bool,
    }

    #[async_trait]
    impl EmailTransport for FakeMailer {
        async fn send(
            &self,
            _channel: &EmailChannel,
            event: &Event,
            attachment: Option<&Path>,
        ) -> Result<(), NotifyError> {
            if self.fail {
                return Err(NotifyError::Email("535 authentication failed".to_string()));
            }
            let log = attachment.map(|p| std::fs::read_to_string(p).unwrap());
            self.sent.lock().unwrap().push((event.summary.clone(), log));
            Ok(())
        }
    }

    fn webhook(name: &str, events: &[Outcome]) -> Channel {
        Channel::Webhook(WebhookChannel {
            id: 0,
            kind: WebhookKind::Generic,
            name: name.to_string(),
            url: "https://example.com/hook".to_string(),
            events: events.to_vec(),
            timeout: None,
            max_retries: 3,
            headers: BTreeMap::new(),
        })
    }

    fn email() -> Channel {
        Channel::Email(EmailChannel {
            id: 9,
            from: "me@gmail.com".to_string(),
            to: vec!["you@example.org".to_string()],
            password: "pw".to_string(),
            smtp: None,
        })
    }

    #[tokio::test]
    async fn test_unsubscribed_webhook_skipped_email_always_sent() {
        let dispatcher = Dispatcher::new(FakeWebhooks::default(), FakeMailer::default());
        let event = Event::new("home", Outcome::Failure, "rsync exited with 23");

        let report = dispatcher
            .dispatch(&event, &[webhook("on-success", &[Outcome::Success]), email()], None)
            .await
            .unwrap();

        assert!(dispatcher.webhook.calls.lock().unwrap().is_empty());
        assert_eq!(report.skipped, vec!["on-success".to_string()]);
        let sent = dispatcher.email.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "rsync exited with 23");
        assert!(report.email_sent);
    }

    #[tokio::test]
    async fn test_failures_recorded_in_log_before_email() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("home.log");
        std::fs::write(&log, "Exit code: 0\n").unwrap();

        let dispatcher = Dispatcher::new(FakeWebhooks::default(), FakeMailer::default());
        let event = Event::new("home", Outcome::Success, "ok");
        let channels = [
            email(),
            webhook("bad-hook", &[Outcome::Success]),
            webhook("good-hook", &[Outcome::Success, Outcome::Failure]),
        ];

        let report = dispatcher.dispatch(&event, &channels, Some(&log)).await.unwrap();

        // Email is listed first but goes out last
        assert_eq!(
            *dispatcher.webhook.calls.lock().unwrap(),
            vec!["bad-hook".to_string(), "good-hook".to_string()]
        );
        assert_eq!(report.failures().count(), 1);

        let sent = dispatcher.email.sent.lock().unwrap();
        let attached = sent[0].1.as_deref().unwrap();
        assert!(attached.starts_with("Exit code: 0\n"));
        assert!(attached.contains(FAILURES_HEADING));
        assert!(attached.contains(
            "[NOTIFICATION SYS: bad-hook] Failed with message: Webhook request failed with HTTP 500"
        ));
        assert!(!attached.contains("good-hook"));
    }

    #[tokio::test]
    async fn test_no_trailer_when_all_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("home.log");
        std::fs::write(&log, "Exit code: 0\n").unwrap();

        let dispatcher = Dispatcher::new(FakeWebhooks::default(), FakeMailer::default());
        let event = Event::new("home", Outcome::Success, "ok");
        dispatcher
            .dispatch(&event, &[webhook("good", &[Outcome::Success])], Some(&log))
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&log).unwrap(), "Exit code: 0\n");
    }

    #[tokio::test]
    async fn test_email_failure_propagates() {
        let mailer = FakeMailer {
            fail: true,
            ..FakeMailer::default()
        };
        let dispatcher = Dispatcher::new(FakeWebhooks::default(), mailer);
        let event = Event::new("home", Outcome::Failure, "boom");

        let err = dispatcher
            .dispatch(&event, &[webhook("good", &[Outcome::Failure]), email()], None)
            .await
            .unwrap_err();

        assert!(matches!(err, NotifyError::Email(_)));
        assert_eq!(dispatcher.webhook.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_channels_is_a_noop() {
        let dispatcher = Dispatcher::new(FakeWebhooks::default(), FakeMailer::default());
        let report = dispatcher
            .dispatch(&Event::new("home", Outcome::Success, "ok"), &[], None)
            .await
            .unwrap();
        assert!(report.webhooks.is_empty());
        assert!(!report.email_sent);
    }
}
