//! Fire-and-forget operator notifications.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a message. Delivery failures are logged, never returned.
    async fn notify(&self, subject: &str, body: &str);
}

/// Logs notifications when no webhook is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        warn!(subject, body, "operator notification");
    }
}

/// Posts `{"content": "..."}` to a chat webhook.
pub struct WebhookNotifier {
    url: String,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        let payload = json!({ "content": format!("**{subject}**\n{body}") });
        match self.client.post(&self.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(subject, "webhook notification delivered");
            }
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                warn!(subject, %status, body = text.as_str(), "webhook notification rejected");
            }
            Err(err) => warn!(subject, error = %err, "webhook notification failed"),
        }
    }
}

/// Webhook when a URL is configured, logging otherwise.
pub fn notifier_for(webhook_url: Option<&str>) -> Box<dyn Notifier> {
    match webhook_url {
        Some(url) => Box::new(WebhookNotifier::new(url)),
        None => Box::new(LogNotifier),
    }
}
