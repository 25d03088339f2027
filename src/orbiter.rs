//! [MODULE A] Orbiter base (§4.1).
//!
//! Grounded in `orbitalis/orbiter/orbiter.py`'s `Orbiter` dataclass:
//! registries, identity, start/stop lifecycle, `retrieve_connections`.
//! Rust has no inheritance, so `Core` and `Plugin` each embed an
//! `OrbiterCore` rather than extending a base class.

use std::{collections::HashMap, sync::Arc, time::Duration as StdDuration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::{watch, Mutex, Notify};

use crate::{
  connection::Connection,
  error::{OrbiterError, TransportError},
  eventbus::EventBus,
  id::{self, OrbiterId},
  messages::{
    CloseConnectionAckMessage, GracefulCloseConnectionMessage, GracelessCloseConnectionMessage, KeepaliveMessage,
    KeepaliveRequestMessage,
  },
  registry::EntryRegistry,
  config::RuntimeConfig,
};

/// A filter for `retrieve_connections` (§4.1): every `Some` field must
/// match; `None` fields are wildcards.
#[derive(Debug, Clone, Default)]
pub struct ConnectionFilter {
  pub remote_id: Option<OrbiterId>,
  pub operation_name: Option<String>,
  pub input_topic: Option<String>,
  pub output_topic: Option<String>,
}

impl ConnectionFilter {
  pub fn matches(&self, conn: &Connection) -> bool {
    if let Some(remote_id) = &self.remote_id {
      if remote_id != &conn.remote_id {
        return false;
      }
    }
    if let Some(operation_name) = &self.operation_name {
      if operation_name != &conn.operation_name {
        return false;
      }
    }
    if let Some(input_topic) = &self.input_topic {
      if input_topic != &conn.input_topic {
        return false;
      }
    }
    if let Some(output_topic) = &self.output_topic {
      if conn.output_topic.as_ref() != Some(output_topic) {
        return false;
      }
    }
    true
  }
}

/// Shared state and operations common to `Core` and `Plugin` (§4.1).
pub struct OrbiterCore {
  pub identifier: OrbiterId,
  pub event_bus: Arc<dyn EventBus>,
  pub config: RuntimeConfig,

  pub connections: EntryRegistry<Connection>,
  pub pending_requests: EntryRegistry<crate::connection::PendingRequest>,

  last_seen: Mutex<HashMap<OrbiterId, DateTime<Utc>>>,
  last_keepalive_sent: Mutex<HashMap<OrbiterId, DateTime<Utc>>>,
  others_consider_me_dead_after: Mutex<HashMap<OrbiterId, StdDuration>>,

  /// Edge-triggered signal tests can await (§5).
  pub new_connection_added: Notify,
  stop_tx: watch::Sender<bool>,
  paused: Mutex<bool>,
}

impl OrbiterCore {
  pub fn new(event_bus: Arc<dyn EventBus>, config: RuntimeConfig) -> Self {
    Self::with_identifier(id::new_orbiter_id(), event_bus, config)
  }

  pub fn with_identifier(identifier: OrbiterId, event_bus: Arc<dyn EventBus>, config: RuntimeConfig) -> Self {
    let (stop_tx, _) = watch::channel(false);
    Self {
      identifier,
      event_bus,
      config,
      connections: EntryRegistry::new(),
      pending_requests: EntryRegistry::new(),
      last_seen: Mutex::new(HashMap::new()),
      last_keepalive_sent: Mutex::new(HashMap::new()),
      others_consider_me_dead_after: Mutex::new(HashMap::new()),
      new_connection_added: Notify::new(),
      stop_tx,
      paused: Mutex::new(false),
    }
  }

  pub async fn connect(&self) -> Result<(), TransportError> {
    self.event_bus.connect().await
  }

  pub async fn note_seen(&self, remote_id: &str) {
    let mut last_seen = self.last_seen.lock().await;
    last_seen.insert(remote_id.to_string(), Utc::now());
  }

  pub async fn note_dead_after(&self, remote_id: &str, dead_after: StdDuration) {
    let mut map = self.others_consider_me_dead_after.lock().await;
    map.insert(remote_id.to_string(), dead_after);
  }

  /// `{id : (now - lastSeen[id]) > considerOthersDeadAfter}` (§4.1).
  pub async fn dead_remote_ids(&self) -> Vec<OrbiterId> {
    let last_seen = self.last_seen.lock().await;
    let dead_after = self.others_consider_me_dead_after.lock().await;
    let threshold = chrono::Duration::from_std(self.config.consider_me_dead_after).unwrap_or(chrono::Duration::zero());
    last_seen
      .iter()
      .filter(|(id, seen_at)| {
        let limit = dead_after
          .get(*id)
          .and_then(|d| chrono::Duration::from_std(*d).ok())
          .unwrap_or(threshold);
        Utc::now() - **seen_at > limit
      })
      .map(|(id, _)| id.clone())
      .collect()
  }

  pub async fn retrieve_connections(&self, filter: &ConnectionFilter) -> Vec<Connection> {
    let mut out = Vec::new();
    for (_, _, handle) in self.connections.snapshot().await {
      let conn = handle.lock().await;
      if filter.matches(&conn) {
        out.push(conn.clone());
      }
    }
    out
  }

  pub async fn send_keepalive(&self, remote_id: &str) -> Result<(), TransportError> {
    let msg = KeepaliveMessage {
      from_id: self.identifier.clone(),
    };
    let payload = Bytes::from(serde_json::to_vec(&msg).expect("KeepaliveMessage always serializes"));
    self.event_bus.publish(&id::keepalive_topic(remote_id), payload).await?;
    let mut last_sent = self.last_keepalive_sent.lock().await;
    last_sent.insert(remote_id.to_string(), Utc::now());
    Ok(())
  }

  pub async fn send_keepalive_request(&self, remote_id: &str) -> Result<(), TransportError> {
    let msg = KeepaliveRequestMessage {
      from_id: self.identifier.clone(),
      keepalive_topic: id::keepalive_topic(&self.identifier),
    };
    let payload = Bytes::from(serde_json::to_vec(&msg).expect("KeepaliveRequestMessage always serializes"));
    self
      .event_bus
      .publish(&id::keepalive_request_topic(remote_id), payload)
      .await?;
    Ok(())
  }

  pub async fn last_keepalive_sent(&self, remote_id: &str) -> Option<DateTime<Utc>> {
    self.last_keepalive_sent.lock().await.get(remote_id).copied()
  }

  /// Graceless close (§4.7): remove locally, unsubscribe, notify peer.
  /// No acknowledgement expected.
  pub async fn send_graceless_close_connection(
    &self,
    remote_id: &str,
    operation_name: &str,
    data: Option<Bytes>,
  ) -> Result<(), OrbiterError> {
    let handle = match self.connections.remove(remote_id, operation_name).await {
      Some(handle) => handle,
      None => {
        warn!("{self}: no connection for ({remote_id}, {operation_name}) to close");
        return Ok(());
      }
    };
    let conn = handle.lock().await;
    let mut topics = vec![conn.incoming_close_topic.clone()];
    if let Some(output_topic) = &conn.output_topic {
      topics.push(output_topic.clone());
    }
    self.event_bus.multi_unsubscribe(&topics, true).await?;

    let msg = GracelessCloseConnectionMessage {
      from_id: self.identifier.clone(),
      operation_name: operation_name.to_string(),
      data,
    };
    let payload = Bytes::from(serde_json::to_vec(&msg).expect("message always serializes"));
    self.event_bus.publish(&conn.close_to_remote_topic, payload).await?;
    info!("{self}: gracelessly closed connection to {remote_id}/{operation_name}");
    Ok(())
  }

  /// Graceful close (§4.7): allocate an ack topic, subscribe, publish,
  /// and await the ack (or the configured timeout before falling back
  /// to graceless removal).
  pub async fn send_graceful_close_connection(
    self: &Arc<Self>,
    remote_id: &str,
    operation_name: &str,
    data: Option<Bytes>,
  ) -> Result<(), OrbiterError> {
    let handle = match self.connections.get(remote_id, operation_name).await {
      Some(handle) => handle,
      None => {
        warn!("{self}: no connection for ({remote_id}, {operation_name}) to close");
        return Ok(());
      }
    };

    let ack_topic = {
      let conn = handle.lock().await;
      id::close_ack_topic(operation_name, &self.identifier, &conn.remote_id)
    };

    let (tx, rx) = tokio::sync::oneshot::channel();
    self
      .event_bus
      .subscribe(&ack_topic, Arc::new(AckSink { sender: Mutex::new(Some(tx)) }))
      .await?;

    let msg = GracefulCloseConnectionMessage {
      from_id: self.identifier.clone(),
      operation_name: operation_name.to_string(),
      ack_topic: ack_topic.clone(),
      data,
    };
    let payload = Bytes::from(serde_json::to_vec(&msg).expect("message always serializes"));
    {
      let conn = handle.lock().await;
      self.event_bus.publish(&conn.close_to_remote_topic, payload).await?;
    }

    let acked = tokio::time::timeout(self.config.graceful_close_timeout, rx).await.is_ok();
    self.event_bus.unsubscribe(&ack_topic).await?;

    if acked {
      self.connections.remove(remote_id, operation_name).await;
      info!("{self}: gracefully closed connection to {remote_id}/{operation_name}");
    } else {
      warn!("{self}: graceful close of ({remote_id}, {operation_name}) timed out; falling back to graceless");
      self
        .send_graceless_close_connection(remote_id, operation_name, None)
        .await?;
    }
    Ok(())
  }

  /// Handle an incoming graceless close: remove the Connection, no ack.
  pub async fn handle_graceless_close(&self, msg: &GracelessCloseConnectionMessage) {
    self.connections.remove(&msg.from_id, &msg.operation_name).await;
    debug!("{self}: peer {} gracelessly closed {}", msg.from_id, msg.operation_name);
  }

  /// Handle an incoming graceful close: remove the Connection and ack.
  pub async fn handle_graceful_close(&self, msg: &GracefulCloseConnectionMessage) -> Result<(), TransportError> {
    self.connections.remove(&msg.from_id, &msg.operation_name).await;
    let ack = CloseConnectionAckMessage {
      from_id: self.identifier.clone(),
      operation_name: msg.operation_name.clone(),
    };
    let payload = Bytes::from(serde_json::to_vec(&ack).expect("ack always serializes"));
    self.event_bus.publish(&msg.ack_topic, payload).await
  }

  pub async fn handle_keepalive(&self, msg: &KeepaliveMessage) {
    self.note_seen(&msg.from_id).await;
  }

  pub async fn handle_keepalive_request(&self, msg: &KeepaliveRequestMessage) -> Result<(), TransportError> {
    let reply = KeepaliveMessage {
      from_id: self.identifier.clone(),
    };
    let payload = Bytes::from(serde_json::to_vec(&reply).expect("keepalive always serializes"));
    self.event_bus.publish(&msg.keepalive_topic, payload).await
  }

  /// Signal the periodic loop to stop. Unsubscribing owned topics (I5)
  /// is a role-specific responsibility (`Core::stop`/`Plugin::stop`)
  /// since only the role knows which topics it currently owns.
  pub fn request_stop(&self) {
    let _ = self.stop_tx.send(true);
  }

  pub fn stop_signal(&self) -> watch::Receiver<bool> {
    self.stop_tx.subscribe()
  }

  pub async fn pause(&self, value: bool) {
    *self.paused.lock().await = value;
  }

  pub async fn is_paused(&self) -> bool {
    *self.paused.lock().await
  }
}

impl std::fmt::Display for OrbiterCore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.identifier)
  }
}

impl std::fmt::Debug for OrbiterCore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("OrbiterCore").field("identifier", &self.identifier).finish()
  }
}

struct AckSink {
  sender: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

#[async_trait::async_trait]
impl crate::eventbus::EventHandler for AckSink {
  async fn on_event(&self, _topic: &str, _payload: Bytes) {
    if let Some(sender) = self.sender.lock().await.take() {
      let _ = sender.send(());
    }
  }
}
