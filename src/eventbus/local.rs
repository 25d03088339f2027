//! In-memory `EventBus` implementation, used as the default transport
//! for the crate's own test suite and for local experimentation
//! (`demos/`). Not a production backend — spec.md explicitly allows
//! local/MQTT/other backends to be interchangeable behind `EventBus`.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use super::{EventBus, EventHandler};
use crate::error::TransportError;

#[derive(Default)]
pub struct LocalEventBus {
  subscribers: Mutex<HashMap<String, Arc<dyn EventHandler>>>,
}

impl LocalEventBus {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl EventBus for LocalEventBus {
  async fn connect(&self) -> Result<(), TransportError> {
    Ok(())
  }

  async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
    let handler = {
      let subscribers = self.subscribers.lock().await;
      subscribers.get(topic).cloned()
    };
    if let Some(handler) = handler {
      handler.on_event(topic, payload).await;
    }
    Ok(())
  }

  async fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> Result<(), TransportError> {
    let mut subscribers = self.subscribers.lock().await;
    subscribers.insert(topic.to_string(), handler);
    Ok(())
  }

  async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
    let mut subscribers = self.subscribers.lock().await;
    subscribers.remove(topic);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;

  struct CountingHandler {
    count: Arc<AtomicUsize>,
  }

  #[async_trait]
  impl EventHandler for CountingHandler {
    async fn on_event(&self, _topic: &str, _payload: Bytes) {
      self.count.fetch_add(1, Ordering::SeqCst);
    }
  }

  #[tokio::test]
  async fn delivers_to_subscribed_handler() {
    let bus = LocalEventBus::new();
    let count = Arc::new(AtomicUsize::new(0));
    bus
      .subscribe("topic-a", Arc::new(CountingHandler { count: count.clone() }))
      .await
      .unwrap();

    bus.publish("topic-a", Bytes::from_static(b"hello")).await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn publish_to_unsubscribed_topic_is_a_no_op() {
    let bus = LocalEventBus::new();
    bus.publish("nobody-home", Bytes::from_static(b"x")).await.unwrap();
  }

  #[tokio::test]
  async fn unsubscribe_stops_delivery() {
    let bus = LocalEventBus::new();
    let count = Arc::new(AtomicUsize::new(0));
    bus
      .subscribe("topic-a", Arc::new(CountingHandler { count: count.clone() }))
      .await
      .unwrap();
    bus.unsubscribe("topic-a").await.unwrap();
    bus.publish("topic-a", Bytes::from_static(b"hello")).await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn multi_unsubscribe_removes_every_topic() {
    let bus = LocalEventBus::new();
    let count = Arc::new(AtomicUsize::new(0));
    bus
      .subscribe("topic-a", Arc::new(CountingHandler { count: count.clone() }))
      .await
      .unwrap();
    bus
      .subscribe("topic-b", Arc::new(CountingHandler { count: count.clone() }))
      .await
      .unwrap();

    bus
      .multi_unsubscribe(&["topic-a".to_string(), "topic-b".to_string()], true)
      .await
      .unwrap();

    bus.publish("topic-a", Bytes::from_static(b"x")).await.unwrap();
    bus.publish("topic-b", Bytes::from_static(b"x")).await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 0);
  }
}
