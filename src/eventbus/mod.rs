//! [MODULE F] The consumed event-bus interface (§6.1).
//!
//! Topics are opaque strings; delivery is at-most-one handler per
//! (client, topic), with no ordering/durability/de-duplication
//! guarantees. Any backend (local, MQTT, ...) implements this trait;
//! the engine never depends on a concrete transport.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;

pub mod local;

/// Invoked once per delivered message on a subscribed topic. Handlers
/// run without blocking the bus; long work should hand off to a
/// spawned task.
#[async_trait]
pub trait EventHandler: Send + Sync {
  async fn on_event(&self, topic: &str, payload: Bytes);
}

/// Blanket impl so plain async closures-as-structs aren't required;
/// callers that already have an `Arc<dyn EventHandler>` can pass it
/// straight through.
#[async_trait]
impl EventHandler for Arc<dyn EventHandler> {
  async fn on_event(&self, topic: &str, payload: Bytes) {
    (**self).on_event(topic, payload).await
  }
}

#[async_trait]
pub trait EventBus: Send + Sync {
  async fn connect(&self) -> Result<(), TransportError>;

  async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;

  async fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> Result<(), TransportError>;

  async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

  /// Unsubscribe from several topics at once. `parallel` hints that the
  /// backend may fan these out concurrently (§5: "spawn short-lived
  /// worker tasks only for parallel publish/unsubscribe fan-out").
  async fn multi_unsubscribe(&self, topics: &[String], parallel: bool) -> Result<(), TransportError> {
    if parallel {
      let results = futures::future::join_all(topics.iter().map(|topic| self.unsubscribe(topic))).await;
      results.into_iter().collect::<Result<Vec<()>, _>>()?;
      return Ok(());
    }
    for topic in topics {
      self.unsubscribe(topic).await?;
    }
    Ok(())
  }
}
