//! Message handler seam
//!
//! Handlers and middleware share one shape, [`MessageHandler`], so wrappers
//! (the shard interceptor, rate limiting, tracing) nest in any order.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// A message delivered by the bus
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub topic: String,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub payload: Value,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Header value by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: InboundMessage) -> anyhow::Result<Value>;
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn handle(&self, message: InboundMessage) -> anyhow::Result<Value> {
        (**self).handle(message).await
    }
}

/// Handler built from a closure, see [`handler_fn`]
pub struct HandlerFn<F> {
    f: F,
}

/// Adapt an async closure into a [`MessageHandler`]
///
/// ```rust,ignore
/// let echo = handler_fn(|message: InboundMessage| async move { Ok(message.payload) });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, message: InboundMessage) -> anyhow::Result<Value> {
        (self.f)(message).await
    }
}
