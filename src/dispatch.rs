use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Outward notification channels. Delivery is best effort: failures are
/// reported as `false`, never raised.
#[async_trait]
pub trait AlertDispatcher: Send + Sync {
    async fn send_email(&self, recipients: &[String], subject: &str, content: &str) -> bool;

    async fn send_sms(&self, phone_number: &str, message: &str) -> bool;
}

/// Truncates to at most `max` characters on a char boundary.
pub(crate) fn preview(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Logs instead of delivering and counts what it was asked to send.
#[derive(Debug)]
pub struct MockDispatcher {
    delivery_delay: Duration,
    emails_sent: AtomicUsize,
    sms_sent: AtomicUsize,
}

impl MockDispatcher {
    pub fn new(delivery_delay: Duration) -> Self {
        Self {
            delivery_delay,
            emails_sent: AtomicUsize::new(0),
            sms_sent: AtomicUsize::new(0),
        }
    }

    pub fn emails_sent(&self) -> usize {
        self.emails_sent.load(Ordering::SeqCst)
    }

    pub fn sms_sent(&self) -> usize {
        self.sms_sent.load(Ordering::SeqCst)
    }
}

impl Default for MockDispatcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl AlertDispatcher for MockDispatcher {
    async fn send_email(&self, recipients: &[String], subject: &str, content: &str) -> bool {
        info!(
            "MOCK EMAIL to [{}] subject={:?} content={:?}...",
            recipients.join(", "),
            subject,
            preview(content, 100)
        );

        // Stand-in for network latency
        sleep(self.delivery_delay).await;
        self.emails_sent.fetch_add(1, Ordering::SeqCst);
        true
    }

    async fn send_sms(&self, phone_number: &str, message: &str) -> bool {
        info!(
            "MOCK SMS to {} message={:?}...",
            phone_number,
            preview(message, 50)
        );
        self.sms_sent.fetch_add(1, Ordering::SeqCst);
        true
    }
}

#[derive(Serialize)]
struct EmailPayload<'a> {
    recipients: &'a [String],
    subject: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct SmsPayload<'a> {
    phone_number: &'a str,
    message: &'a str,
}

/// Live channel that posts JSON payloads to HTTP endpoints.
#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    client: Client,
    email_url: Option<String>,
    sms_url: Option<String>,
}

impl WebhookDispatcher {
    pub fn new(email_url: Option<String>, sms_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            email_url,
            sms_url,
        }
    }

    async fn post<T: Serialize + Sync + ?Sized>(
        &self,
        channel: &str,
        url: Option<&str>,
        body: &T,
    ) -> bool {
        let Some(url) = url else {
            warn!("No {} webhook configured, alert not delivered", channel);
            return false;
        };

        match self.client.post(url).json(body).send().await {
            Ok(response) if response.status().is_success() => {
                info!("{} alert delivered via {}", channel, url);
                true
            }
            Ok(response) => {
                warn!(
                    "{} webhook {} answered with status {}",
                    channel,
                    url,
                    response.status()
                );
                false
            }
            Err(err) => {
                warn!("{} webhook {} failed: {}", channel, url, err);
                false
            }
        }
    }
}

#[async_trait]
impl AlertDispatcher for WebhookDispatcher {
    async fn send_email(&self, recipients: &[String], subject: &str, content: &str) -> bool {
        let payload = EmailPayload {
            recipients,
            subject,
            content,
        };
        self.post("email", self.email_url.as_deref(), &payload).await
    }

    async fn send_sms(&self, phone_number: &str, message: &str) -> bool {
        let payload = SmsPayload {
            phone_number,
            message,
        };
        self.post("sms", self.sms_url.as_deref(), &payload).await
    }
}
