//! [MODULE C] Plugin role (§4.3).
//!
//! Grounded in `orbitalis/plugin/handler/handshake.py` (discover/reply
//! dispatch shape) and `plugin/operation.py` (operation registration),
//! adapted to spec.md's Discover/Offer/Request/Confirm protocol.

use std::{
  collections::HashMap,
  sync::{Arc, Weak},
};

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::{
  connection::PendingRequest,
  error::OrbiterError,
  eventbus::EventHandler,
  id,
  messages::{
    ConfirmConnectionMessage, DiscoverMessage, KeepaliveMessage, KeepaliveRequestMessage, OfferMessage,
    OfferedOperation, OperationNoLongerAvailableMessage, RejectOperationMessage, RequestOperationMessage,
  },
  operation::Operation,
  orbiter::OrbiterCore,
};

pub struct Plugin {
  pub base: Arc<OrbiterCore>,
  operations: HashMap<String, Operation>,
  reply_topic: String,
  reply_subscribed: Mutex<bool>,
  loop_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Plugin {
  pub fn builder(event_bus: Arc<dyn crate::eventbus::EventBus>) -> PluginBuilder {
    PluginBuilder::new(event_bus)
  }

  pub fn identifier(&self) -> &str {
    &self.base.identifier
  }

  pub async fn start(self: &Arc<Self>) -> Result<(), OrbiterError> {
    info!("{self}: starting...");
    self.base.connect().await?;

    self
      .base
      .event_bus
      .subscribe(
        &id::keepalive_topic(self.identifier()),
        Arc::new(PluginKeepaliveHandler { plugin: Arc::downgrade(self) }),
      )
      .await?;
    self
      .base
      .event_bus
      .subscribe(
        &id::keepalive_request_topic(self.identifier()),
        Arc::new(PluginKeepaliveRequestHandler { plugin: Arc::downgrade(self) }),
      )
      .await?;
    self
      .base
      .event_bus
      .subscribe(id::DISCOVER_TOPIC, Arc::new(PluginDiscoverHandler { plugin: Arc::downgrade(self) }))
      .await?;

    let weak = Arc::downgrade(self);
    let interval = self.base.config.loop_interval;
    let mut stop_rx = self.base.stop_signal();
    let handle = tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = tokio::time::sleep(interval) => {
            if let Some(plugin) = weak.upgrade() {
              plugin.on_loop_tick().await;
            } else {
              break;
            }
          }
          _ = stop_rx.changed() => break,
        }
      }
    });
    *self.loop_handle.lock().await = Some(handle);

    info!("{self}: started");
    Ok(())
  }

  pub async fn stop(self: &Arc<Self>) -> Result<(), OrbiterError> {
    info!("{self}: stopping...");
    self.base.request_stop();
    if let Some(handle) = self.loop_handle.lock().await.take() {
      let _ = handle.await;
    }

    let mut topics = vec![
      id::keepalive_topic(self.identifier()),
      id::keepalive_request_topic(self.identifier()),
      id::DISCOVER_TOPIC.to_string(),
    ];
    if *self.reply_subscribed.lock().await {
      topics.push(self.reply_topic.clone());
    }
    for (_, _, handle) in self.base.connections.snapshot().await {
      let conn = handle.lock().await;
      topics.push(conn.input_topic.clone());
      topics.push(conn.incoming_close_topic.clone());
    }
    self.base.event_bus.multi_unsubscribe(&topics, true).await?;
    info!("{self}: stopped");
    Ok(())
  }

  async fn on_loop_tick(self: &Arc<Self>) {
    if self.base.is_paused().await {
      return;
    }

    if let Some(idle_after) = self.base.config.close_connection_if_unused_after {
      for (remote_id, operation_name, handle) in self.base.connections.snapshot().await {
        let idle = handle.lock().await.idle_for();
        if idle > chrono::Duration::from_std(idle_after).unwrap_or(chrono::Duration::zero()) {
          let this = self.clone();
          tokio::spawn(async move {
            let _ = this.base.send_graceful_close_connection(&remote_id, &operation_name, None).await;
          });
        }
      }
    }

    for (remote_id, operation_name, handle) in self.base.pending_requests.snapshot().await {
      let age = handle.lock().await.age();
      let expired = age > chrono::Duration::from_std(self.base.config.pending_requests_expire_after).unwrap_or(chrono::Duration::zero());
      let ttl_expired = self.base.config.offer_expires_after.map_or(false, |ttl| {
        age > chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero())
      });
      if expired || ttl_expired {
        self.base.pending_requests.remove(&remote_id, &operation_name).await;
        debug!("{self}: dropped expired pending request for ({remote_id}, {operation_name})");
      }
    }

    for (remote_id, _, _) in self.base.connections.snapshot().await {
      if let Err(err) = self.base.send_keepalive(&remote_id).await {
        warn!("{self}: failed to send keepalive to {remote_id}: {err}");
      }
    }
  }

  async fn connected_and_pending_count(&self, operation_name: &str) -> usize {
    self.base.connections.count_for_operation(operation_name).await
      + self.base.pending_requests.count_for_operation(operation_name).await
  }

  async fn can_lend(&self, core_id: &str, operation: &Operation) -> bool {
    operation.policy.is_compatible(core_id) && {
      let current = self.connected_and_pending_count(&operation.name).await;
      operation.policy.has_room(current)
    }
  }

  async fn ensure_reply_subscribed(self: &Arc<Self>) -> Result<(), crate::error::TransportError> {
    let mut subscribed = self.reply_subscribed.lock().await;
    if *subscribed {
      return Ok(());
    }
    self
      .base
      .event_bus
      .subscribe(&self.reply_topic, Arc::new(PluginReplyHandler { plugin: Arc::downgrade(self) }))
      .await?;
    *subscribed = true;
    Ok(())
  }

  async fn handle_discover(self: &Arc<Self>, msg: DiscoverMessage) {
    self.base.note_seen(&msg.core_id).await;
    self
      .base
      .note_dead_after(&msg.core_id, std::time::Duration::from_millis(msg.consider_me_dead_after_ms))
      .await;

    let mut offered = Vec::new();
    for (name, needed) in &msg.needed_operations {
      let Some(operation) = self.operations.get(name) else {
        continue;
      };
      if self.base.pending_requests.contains(&msg.core_id, name).await
        || self.base.connections.contains(&msg.core_id, name).await
      {
        continue;
      }
      if !self.can_lend(&msg.core_id, operation).await {
        continue;
      }
      let input_ok = needed.inputs.iter().any(|spec| spec.is_compatible(&operation.input, false, false));
      let output_ok = needed.outputs.iter().any(|spec| spec.is_compatible(&operation.output, false, false));
      if !input_ok || !output_ok {
        continue;
      }
      offered.push((name.clone(), operation));
    }

    if offered.is_empty() {
      return;
    }

    for (name, operation) in &offered {
      let mut pending = PendingRequest::new(name.clone(), msg.core_id.clone());
      pending.input = Some(operation.input.clone());
      pending.output = Some(operation.output.clone());
      self.base.pending_requests.insert(msg.core_id.clone(), name.clone(), pending).await;
    }

    if let Err(err) = self.ensure_reply_subscribed().await {
      warn!("{self}: failed to subscribe reply topic: {err}");
      return;
    }

    let offer = OfferMessage {
      plugin_id: self.identifier().to_string(),
      offered_operations: offered
        .iter()
        .map(|(name, operation)| OfferedOperation {
          name: name.clone(),
          input: operation.input.clone(),
          output: operation.output.clone(),
        })
        .collect(),
      reply_topic: self.reply_topic.clone(),
      plugin_keepalive_topic: id::keepalive_topic(self.identifier()),
      plugin_keepalive_request_topic: id::keepalive_request_topic(self.identifier()),
      consider_me_dead_after_ms: self.base.config.consider_me_dead_after.as_millis() as u64,
    };
    let payload = Bytes::from(serde_json::to_vec(&offer).expect("OfferMessage always serializes"));
    if let Err(err) = self.base.event_bus.publish(&msg.offer_topic, payload).await {
      warn!("{self}: failed to publish offer: {err}");
    }
  }

  async fn handle_request(self: &Arc<Self>, msg: RequestOperationMessage) {
    let Some(handle) = self.base.pending_requests.get(&msg.core_id, &msg.operation_name).await else {
      warn!("{self}: request for unknown pending ({}, {})", msg.core_id, msg.operation_name);
      self.send_no_longer_available(&msg.response_topic, &msg.operation_name).await;
      return;
    };

    let operation = match self.operations.get(&msg.operation_name) {
      Some(op) => op,
      None => {
        self.base.pending_requests.remove(&msg.core_id, &msg.operation_name).await;
        self.send_no_longer_available(&msg.response_topic, &msg.operation_name).await;
        return;
      }
    };

    if !self.can_lend(&msg.core_id, operation).await {
      self.base.pending_requests.remove(&msg.core_id, &msg.operation_name).await;
      self.send_no_longer_available(&msg.response_topic, &msg.operation_name).await;
      return;
    }

    let input_topic = id::input_topic(&msg.operation_name, &msg.core_id, self.identifier());
    let plugin_side_close_topic = id::close_topic(&msg.operation_name, self.identifier(), &msg.core_id);

    if let Err(err) = self
      .base
      .event_bus
      .subscribe(
        &input_topic,
        Arc::new(PluginInputHandler {
          plugin: Arc::downgrade(self),
          operation_name: msg.operation_name.clone(),
          core_id: msg.core_id.clone(),
        }),
      )
      .await
    {
      warn!("{self}: failed to subscribe input topic: {err}");
      return;
    }
    if let Err(err) = self
      .base
      .event_bus
      .subscribe(
        &plugin_side_close_topic,
        Arc::new(PluginCloseHandler { plugin: Arc::downgrade(self) }),
      )
      .await
    {
      warn!("{self}: failed to subscribe close topic: {err}");
      return;
    }

    let confirm = ConfirmConnectionMessage {
      plugin_id: self.identifier().to_string(),
      operation_name: msg.operation_name.clone(),
      operation_input_topic: input_topic.clone(),
      plugin_side_close_topic: plugin_side_close_topic.clone(),
    };
    let payload = Bytes::from(serde_json::to_vec(&confirm).expect("ConfirmConnectionMessage always serializes"));
    if let Err(err) = self.base.event_bus.publish(&msg.response_topic, payload).await {
      warn!("{self}: failed to publish confirm: {err}");
      return;
    }

    let pending = {
      let mut guard = handle.lock().await;
      guard.input_topic = Some(input_topic);
      guard.output_topic = msg.output_topic.clone();
      guard.incoming_close_topic = Some(plugin_side_close_topic);
      guard.close_to_remote_topic = Some(msg.core_side_close_topic.clone());
      guard.clone()
    };
    self.base.pending_requests.remove(&msg.core_id, &msg.operation_name).await;

    match pending.into_connection() {
      Ok(conn) => {
        self
          .base
          .connections
          .insert(msg.core_id.clone(), msg.operation_name.clone(), conn)
          .await;
        self.base.new_connection_added.notify_waiters();
      }
      Err(err) => warn!("{self}: dropping incomplete connection after confirm: {err}"),
    }
  }

  /// Open Question #2 (resolved: send preemptively rather than
  /// dropping silently — see SPEC_FULL.md). Published on the core's
  /// response topic, where `CoreResponseHandler` listens for both
  /// Confirm and NoLongerAvailable.
  async fn send_no_longer_available(&self, response_topic: &str, operation_name: &str) {
    let msg = OperationNoLongerAvailableMessage {
      plugin_id: self.identifier().to_string(),
      operation_name: operation_name.to_string(),
    };
    let payload = Bytes::from(serde_json::to_vec(&msg).expect("message always serializes"));
    let _ = self.base.event_bus.publish(response_topic, payload).await;
  }

  async fn handle_reject(&self, msg: RejectOperationMessage) {
    self.base.pending_requests.remove(&msg.core_id, &msg.operation_name).await;
    debug!("{self}: {} rejected by core {}", msg.operation_name, msg.core_id);
  }
}

impl std::fmt::Display for Plugin {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.base.identifier)
  }
}

pub struct PluginBuilder {
  identifier: Option<String>,
  event_bus: Arc<dyn crate::eventbus::EventBus>,
  config: Option<crate::config::RuntimeConfig>,
  operations: HashMap<String, Operation>,
}

impl PluginBuilder {
  pub fn new(event_bus: Arc<dyn crate::eventbus::EventBus>) -> Self {
    Self {
      identifier: None,
      event_bus,
      config: None,
      operations: HashMap::new(),
    }
  }

  pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
    self.identifier = Some(identifier.into());
    self
  }

  pub fn config(mut self, config: crate::config::RuntimeConfig) -> Self {
    self.config = Some(config);
    self
  }

  pub fn operation(mut self, operation: Operation) -> Self {
    self.operations.insert(operation.name.clone(), operation);
    self
  }

  pub fn build(self) -> Arc<Plugin> {
    let identifier = self.identifier.unwrap_or_else(id::new_orbiter_id);
    let config = self.config.unwrap_or_default();
    let reply_topic = id::reply_topic(&identifier);
    let base = Arc::new(OrbiterCore::with_identifier(identifier, self.event_bus, config));
    Arc::new(Plugin {
      base,
      operations: self.operations,
      reply_topic,
      reply_subscribed: Mutex::new(false),
      loop_handle: Mutex::new(None),
    })
  }
}

struct PluginDiscoverHandler {
  plugin: Weak<Plugin>,
}

#[async_trait::async_trait]
impl EventHandler for PluginDiscoverHandler {
  async fn on_event(&self, _topic: &str, payload: Bytes) {
    let Some(plugin) = self.plugin.upgrade() else { return };
    match serde_json::from_slice::<DiscoverMessage>(&payload) {
      Ok(msg) => plugin.handle_discover(msg).await,
      Err(err) => warn!("{plugin}: malformed DiscoverMessage: {err}"),
    }
  }
}

struct PluginReplyHandler {
  plugin: Weak<Plugin>,
}

#[async_trait::async_trait]
impl EventHandler for PluginReplyHandler {
  async fn on_event(&self, _topic: &str, payload: Bytes) {
    let Some(plugin) = self.plugin.upgrade() else { return };
    if let Ok(msg) = serde_json::from_slice::<RequestOperationMessage>(&payload) {
      plugin.handle_request(msg).await;
      return;
    }
    if let Ok(msg) = serde_json::from_slice::<RejectOperationMessage>(&payload) {
      plugin.handle_reject(msg).await;
    }
  }
}

struct PluginKeepaliveHandler {
  plugin: Weak<Plugin>,
}

#[async_trait::async_trait]
impl EventHandler for PluginKeepaliveHandler {
  async fn on_event(&self, _topic: &str, payload: Bytes) {
    let Some(plugin) = self.plugin.upgrade() else { return };
    if let Ok(msg) = serde_json::from_slice::<KeepaliveMessage>(&payload) {
      plugin.base.handle_keepalive(&msg).await;
    }
  }
}

struct PluginKeepaliveRequestHandler {
  plugin: Weak<Plugin>,
}

#[async_trait::async_trait]
impl EventHandler for PluginKeepaliveRequestHandler {
  async fn on_event(&self, _topic: &str, payload: Bytes) {
    let Some(plugin) = self.plugin.upgrade() else { return };
    if let Ok(msg) = serde_json::from_slice::<KeepaliveRequestMessage>(&payload) {
      let _ = plugin.base.handle_keepalive_request(&msg).await;
    }
  }
}

struct PluginCloseHandler {
  plugin: Weak<Plugin>,
}

#[async_trait::async_trait]
impl EventHandler for PluginCloseHandler {
  async fn on_event(&self, _topic: &str, payload: Bytes) {
    let Some(plugin) = self.plugin.upgrade() else { return };
    if let Ok(msg) = serde_json::from_slice::<crate::messages::GracefulCloseConnectionMessage>(&payload) {
      let _ = plugin.base.handle_graceful_close(&msg).await;
      return;
    }
    if let Ok(msg) = serde_json::from_slice::<crate::messages::GracelessCloseConnectionMessage>(&payload) {
      plugin.base.handle_graceless_close(&msg).await;
    }
  }
}

struct PluginInputHandler {
  plugin: Weak<Plugin>,
  operation_name: String,
  core_id: String,
}

#[async_trait::async_trait]
impl EventHandler for PluginInputHandler {
  async fn on_event(&self, _topic: &str, payload: Bytes) {
    let Some(plugin) = self.plugin.upgrade() else { return };
    let Some(operation) = plugin.operations.get(&self.operation_name) else { return };
    let Some(handle) = plugin.base.connections.get(&self.core_id, &self.operation_name).await else {
      return;
    };

    let output_topic = {
      let mut conn = handle.lock().await;
      conn.touch();
      conn.output_topic.clone()
    };

    let payload = if payload.is_empty() { None } else { Some(payload) };
    let result = operation.handler.handle(payload).await;

    if let (Some(output_topic), Some(result)) = (output_topic, result) {
      let _ = plugin.base.event_bus.publish(&output_topic, result).await;
    }
  }
}
