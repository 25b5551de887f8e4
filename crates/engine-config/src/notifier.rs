use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyLevel {
    Info,
    Warning,
    Error,
}

/// Alert channel. Delivery is best-effort: failures are logged, never
/// propagated to the sync path.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, level: NotifyLevel, title: &str, message: &str);
}

/// Logs notifications through the tracing subscriber.
#[derive(Debug, Default)]
pub struct ConsoleNotifier;

#[async_trait]
impl Notifier for ConsoleNotifier {
    async fn notify(&self, level: NotifyLevel, title: &str, message: &str) {
        match level {
            NotifyLevel::Info => info!(title, "{message}"),
            NotifyLevel::Warning => warn!(title, "{message}"),
            NotifyLevel::Error => error!(title, "{message}"),
        }
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    level: NotifyLevel,
    title: &'a str,
    message: &'a str,
    source: &'static str,
}

/// POSTs notifications as JSON to a configured HTTP endpoint.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        WebhookNotifier {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, level: NotifyLevel, title: &str, message: &str) {
        let payload = WebhookPayload {
            level,
            title,
            message,
            source: "cdc-sync",
        };

        let result = self
            .client
            .post(&self.url)
            .json(&payload)
            .timeout(Duration::from_secs(10))
            .send()
            .await;

        match result {
            Ok(response) if !response.status().is_success() => {
                warn!(status = %response.status(), url = %self.url, "webhook notification rejected");
            }
            Ok(_) => {}
            Err(err) => {
                error!(error = %err, url = %self.url, "webhook notification failed");
            }
        }
    }
}

/// Fan-out over the configured channels. Passed explicitly to the engine; no
/// process-wide singleton.
#[derive(Clone, Default)]
pub struct NotifierRegistry {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl NotifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a console channel, the usual starting point.
    pub fn with_console() -> Self {
        let mut registry = Self::new();
        registry.add(Arc::new(ConsoleNotifier));
        registry
    }

    pub fn add(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifiers.push(notifier);
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    pub async fn notify(&self, level: NotifyLevel, title: &str, message: &str) {
        for notifier in &self.notifiers {
            notifier.notify(level, title, message).await;
        }
    }

    pub async fn info(&self, title: &str, message: &str) {
        self.notify(NotifyLevel::Info, title, message).await;
    }

    pub async fn warning(&self, title: &str, message: &str) {
        self.notify(NotifyLevel::Warning, title, message).await;
    }

    pub async fn error(&self, title: &str, message: &str) {
        self.notify(NotifyLevel::Error, title, message).await;
    }
}
