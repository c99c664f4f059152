use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use reqwest::Client;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::channel::NotificationEvent;
use crate::error::DispatchError;
use crate::youtube::normalize_base;

pub const DEFAULT_EMAIL_API_BASE: &str = "https://api.resend.com/";
pub const DEFAULT_EMAIL_FROM: &str = "YouTube Notifier <notifications@resend.dev>";

/// Delivers new-item events. Errors are reported to the caller, which logs
/// them; no retry happens in the core.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn dispatch(&self, event: &NotificationEvent) -> Result<(), DispatchError>;
}

#[derive(Debug, Clone, Default)]
pub struct LogDispatcher;

#[async_trait]
impl Dispatcher for LogDispatcher {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn dispatch(&self, event: &NotificationEvent) -> Result<(), DispatchError> {
        info!(
            channel = %event.channel_name(),
            item = %event.item.id,
            title = %event.item.title,
            url = %event.item.url,
            "new upload"
        );
        Ok(())
    }
}

/// Posts a Discord-compatible `{"content": …}` payload.
#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    client: Client,
    url: String,
}

impl WebhookDispatcher {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Dispatcher for WebhookDispatcher {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn dispatch(&self, event: &NotificationEvent) -> Result<(), DispatchError> {
        let content = format!(
            "New video from {}: {}\n{}",
            event.channel_name(),
            event.item.title,
            event.item.url
        );
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "content": content }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DispatchError::Rejected {
                sink: self.name(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// Sends a plain-text email through the Resend HTTP API.
#[derive(Clone)]
pub struct EmailDispatcher {
    client: Client,
    api_key: String,
    api_base: String,
    from: String,
    to: String,
}

impl std::fmt::Debug for EmailDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailDispatcher")
            .field("api_base", &self.api_base)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl EmailDispatcher {
    pub fn new(client: Client, api_key: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            api_base: DEFAULT_EMAIL_API_BASE.to_owned(),
            from: DEFAULT_EMAIL_FROM.to_owned(),
            to: to.into(),
        }
    }

    pub fn with_api_base(mut self, base: &str) -> Self {
        self.api_base = normalize_base(base);
        self
    }

    pub fn with_sender(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }
}

#[async_trait]
impl Dispatcher for EmailDispatcher {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn dispatch(&self, event: &NotificationEvent) -> Result<(), DispatchError> {
        let published = event
            .item
            .published_at
            .map(|at| at.format("%B %d, %Y at %H:%M UTC").to_string())
            .unwrap_or_else(|| "recently".to_owned());
        let body = json!({
            "from": self.from,
            "to": [self.to],
            "subject": format!("New video: {} - {}", event.channel_name(), event.item.title),
            "text": format!(
                "{} published \"{}\" ({}).\n\nWatch: {}",
                event.channel_name(),
                event.item.title,
                published,
                event.item.url
            ),
        });
        let response = self
            .client
            .post(format!("{}emails", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DispatchError::Rejected {
                sink: self.name(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// Forwards events to an in-process consumer.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<NotificationEvent>,
}

impl ChannelDispatcher {
    pub fn new(tx: mpsc::Sender<NotificationEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Dispatcher for ChannelDispatcher {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn dispatch(&self, event: &NotificationEvent) -> Result<(), DispatchError> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| DispatchError::ReceiverClosed)
    }
}

/// Hands every event to all sinks concurrently. Each failing sink is logged;
/// the aggregate fails if any sink did.
#[derive(Clone, Default)]
pub struct FanOutDispatcher {
    sinks: Vec<Arc<dyn Dispatcher>>,
}

impl FanOutDispatcher {
    pub fn new(sinks: Vec<Arc<dyn Dispatcher>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn Dispatcher>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl Dispatcher for FanOutDispatcher {
    fn name(&self) -> &'static str {
        "fan-out"
    }

    async fn dispatch(&self, event: &NotificationEvent) -> Result<(), DispatchError> {
        let results = join_all(self.sinks.iter().map(|sink| sink.dispatch(event))).await;
        let mut failed = 0;
        for (sink, result) in self.sinks.iter().zip(results) {
            if let Err(err) = result {
                failed += 1;
                warn!(sink = sink.name(), item = %event.item.id, error = %err, "notification delivery failed");
            }
        }
        if failed > 0 {
            return Err(DispatchError::Partial {
                failed,
                total: self.sinks.len(),
            });
        }
        Ok(())
    }
}
