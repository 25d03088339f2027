//! [MODULE B] Core role (§4.2).
//!
//! Grounded in `orbitalis/core/handler/handshake.py` (offer/response
//! dispatch shape) and `core/need.py`/`core/configuration.py` (the
//! requirement → residual Need computation), adapted to spec.md's
//! four-phase Discover/Offer/Request/Confirm protocol, which differs
//! from the Python drafts' two-phase Offer/Reply shape.

use std::{
  collections::{HashMap, HashSet},
  sync::{Arc, Weak},
};

use bytes::Bytes;
use log::{debug, info, warn};
use rand::seq::IndexedRandom;
use tokio::sync::Mutex;

use crate::{
  connection::PendingRequest,
  error::{OrbiterError, ProtocolError, TransportError},
  eventbus::EventHandler,
  id,
  messages::{
    ConfirmConnectionMessage, DiscoverMessage, KeepaliveMessage, KeepaliveRequestMessage, NeededOperation,
    OfferMessage, OperationNoLongerAvailableMessage, RejectOperationMessage, RequestOperationMessage,
  },
  orbiter::{ConnectionFilter, OrbiterCore},
  policy::OperationRequirement,
  schema::SchemaSpec,
};

/// §4.2's compliance state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComplianceState {
  Created,
  Compliant,
  NotCompliant,
  Stopped,
}

pub struct Core {
  pub base: Arc<OrbiterCore>,
  requirements: Mutex<HashMap<String, OperationRequirement>>,
  offer_topic: String,
  response_topic: String,
  response_subscribed: Mutex<bool>,
  compliance: Mutex<ComplianceState>,
  loop_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Core {
  pub fn builder(event_bus: Arc<dyn crate::eventbus::EventBus>) -> CoreBuilder {
    CoreBuilder::new(event_bus)
  }

  pub fn identifier(&self) -> &str {
    &self.base.identifier
  }

  pub async fn compliance(&self) -> ComplianceState {
    *self.compliance.lock().await
  }

  pub async fn retrieve_connections(&self, filter: &ConnectionFilter) -> Vec<crate::connection::Connection> {
    self.base.retrieve_connections(filter).await
  }

  pub async fn start(self: &Arc<Self>) -> Result<(), OrbiterError> {
    info!("{self}: starting...");
    self.base.connect().await?;

    self
      .base
      .event_bus
      .subscribe(&id::keepalive_topic(self.identifier()), Arc::new(CoreKeepaliveHandler { core: Arc::downgrade(self) }))
      .await?;
    self
      .base
      .event_bus
      .subscribe(
        &id::keepalive_request_topic(self.identifier()),
        Arc::new(CoreKeepaliveRequestHandler { core: Arc::downgrade(self) }),
      )
      .await?;
    self
      .base
      .event_bus
      .subscribe(&self.offer_topic, Arc::new(CoreOfferHandler { core: Arc::downgrade(self) }))
      .await?;

    self.emit_discover().await?;
    self.recompute_compliance().await;

    let weak = Arc::downgrade(self);
    let interval = self.base.config.loop_interval;
    let mut stop_rx = self.base.stop_signal();
    let handle = tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = tokio::time::sleep(interval) => {
            if let Some(core) = weak.upgrade() {
              core.on_loop_tick().await;
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
      self.offer_topic.clone(),
    ];
    if *self.response_subscribed.lock().await {
      topics.push(self.response_topic.clone());
    }
    for (_, _, handle) in self.base.connections.snapshot().await {
      let conn = handle.lock().await;
      topics.push(conn.incoming_close_topic.clone());
      if let Some(output_topic) = &conn.output_topic {
        topics.push(output_topic.clone());
      }
    }
    self.base.event_bus.multi_unsubscribe(&topics, true).await?;
    *self.compliance.lock().await = ComplianceState::Stopped;

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
            this.recompute_compliance().await;
          });
        }
      }
    }

    for (remote_id, operation_name, handle) in self.base.pending_requests.snapshot().await {
      let expired = handle.lock().await.age()
        > chrono::Duration::from_std(self.base.config.pending_requests_expire_after).unwrap_or(chrono::Duration::zero());
      if expired {
        self.base.pending_requests.remove(&remote_id, &operation_name).await;
        debug!("{self}: dropped expired pending request for ({remote_id}, {operation_name})");
      }
    }

    for (remote_id, _, _) in self.base.connections.snapshot().await {
      if let Err(err) = self.base.send_keepalive(&remote_id).await {
        warn!("{self}: failed to send keepalive to {remote_id}: {err}");
      }
    }

    if self.compliance().await != ComplianceState::Compliant {
      if let Err(err) = self.emit_discover().await {
        warn!("{self}: failed to emit discover: {err}");
      }
    }
  }

  pub async fn requirement(&self, operation_name: impl Into<String>, requirement: OperationRequirement) {
    self.requirements.lock().await.insert(operation_name.into(), requirement);
    self.recompute_compliance().await;
  }

  /// Requirement → residual Need (§4.2).
  async fn residual_need(&self, operation_name: &str, requirement: &OperationRequirement) -> crate::policy::Need {
    let connected_count = self.base.connections.count_for_operation(operation_name).await;
    let connected_ids: HashSet<String> = self
      .base
      .connections
      .remote_ids_for_operation(operation_name)
      .await
      .into_iter()
      .collect();
    requirement.constraint.residual(connected_count, &connected_ids)
  }

  async fn emit_discover(&self) -> Result<(), TransportError> {
    let requirements = self.requirements.lock().await;
    let mut needed = HashMap::new();
    for (name, requirement) in requirements.iter() {
      let need = self.residual_need(name, requirement).await;
      if need.worth_discovering() {
        needed.insert(name.clone(), NeededOperation::from_need(&need));
      }
    }
    drop(requirements);

    if needed.is_empty() {
      debug!("{self}: nothing worth discovering");
      return Ok(());
    }

    let msg = DiscoverMessage {
      core_id: self.identifier().to_string(),
      needed_operations: needed,
      offer_topic: self.offer_topic.clone(),
      core_keepalive_topic: id::keepalive_topic(self.identifier()),
      core_keepalive_request_topic: id::keepalive_request_topic(self.identifier()),
      consider_me_dead_after_ms: self.base.config.consider_me_dead_after.as_millis() as u64,
    };
    let payload = Bytes::from(serde_json::to_vec(&msg).expect("DiscoverMessage always serializes"));
    self.base.event_bus.publish(id::DISCOVER_TOPIC, payload).await
  }

  async fn ensure_response_subscribed(self: &Arc<Self>) -> Result<(), TransportError> {
    let mut subscribed = self.response_subscribed.lock().await;
    if *subscribed {
      return Ok(());
    }
    self
      .base
      .event_bus
      .subscribe(&self.response_topic, Arc::new(CoreResponseHandler { core: Arc::downgrade(self) }))
      .await?;
    *subscribed = true;
    Ok(())
  }

  async fn handle_offer(self: &Arc<Self>, msg: OfferMessage) {
    self.base.note_seen(&msg.plugin_id).await;
    self
      .base
      .note_dead_after(&msg.plugin_id, std::time::Duration::from_millis(msg.consider_me_dead_after_ms))
      .await;

    // Decide accept/reject per offered operation first (needs the
    // requirements lock), then fan the resulting publishes out
    // concurrently (§4.2: "for each offered operation, in parallel").
    let mut accepts = Vec::new();
    let mut rejects = Vec::new();
    {
      let requirements = self.requirements.lock().await;
      for offered in &msg.offered_operations {
        let Some(requirement) = requirements.get(&offered.name) else {
          continue;
        };
        let need = self.residual_need(&offered.name, requirement).await;

        let acceptable = need.is_constraint_compatible(&msg.plugin_id, &offered.input, &offered.output)
          && need.worth_discovering()
          && !self.base.pending_requests.contains(&msg.plugin_id, &offered.name).await
          && !self.base.connections.contains(&msg.plugin_id, &offered.name).await;

        if acceptable {
          accepts.push((offered.clone(), requirement.default_setup_data.clone()));
        } else {
          rejects.push(offered.name.clone());
        }
      }
    }

    if !accepts.is_empty() && self.ensure_response_subscribed().await.is_err() {
      warn!("{self}: failed to subscribe response topic");
      return;
    }

    let reject_publishes = rejects.iter().map(|operation_name| {
      let reply_topic = msg.reply_topic.clone();
      let reject = RejectOperationMessage {
        core_id: self.identifier().to_string(),
        operation_name: operation_name.clone(),
      };
      async move {
        let payload = Bytes::from(serde_json::to_vec(&reject).expect("reject always serializes"));
        self.base.event_bus.publish(&reply_topic, payload).await
      }
    });

    let request_publishes = accepts.iter().map(|(offered, setup_data)| {
      let core_side_close_topic = id::close_topic(&offered.name, self.identifier(), &msg.plugin_id);
      let output_topic = if !matches!(offered.output, SchemaSpec::Empty) {
        Some(id::output_topic(&offered.name, self.identifier(), &msg.plugin_id))
      } else {
        None
      };
      let request = RequestOperationMessage {
        core_id: self.identifier().to_string(),
        operation_name: offered.name.clone(),
        response_topic: self.response_topic.clone(),
        output_topic: output_topic.clone(),
        core_side_close_topic: core_side_close_topic.clone(),
        setup_data: setup_data.clone(),
      };
      let reply_topic = msg.reply_topic.clone();
      let plugin_id = msg.plugin_id.clone();
      let operation_name = offered.name.clone();

      let mut pending = PendingRequest::new(operation_name.clone(), plugin_id.clone());
      pending.input = Some(offered.input.clone());
      pending.output = Some(offered.output.clone());
      pending.output_topic = output_topic;
      pending.incoming_close_topic = Some(core_side_close_topic);

      async move {
        // §4.2: "pre-create a PendingRequest locally; publish
        // RequestOperationMessage." The pending must be visible *before*
        // the publish returns, since an in-process event bus can deliver
        // the Request and a reentrant Confirm synchronously within this
        // `publish` call.
        self.base.pending_requests.insert(plugin_id.clone(), operation_name.clone(), pending).await;
        let payload = Bytes::from(serde_json::to_vec(&request).expect("request always serializes"));
        if let Err(err) = self.base.event_bus.publish(&reply_topic, payload).await {
          self.base.pending_requests.remove(&plugin_id, &operation_name).await;
          return Err(err);
        }
        Ok(())
      }
    });

    let (reject_results, request_results) =
      futures::join!(futures::future::join_all(reject_publishes), futures::future::join_all(request_publishes));

    for result in reject_results {
      if let Err(err) = result {
        warn!("{self}: failed to publish reject: {err}");
      }
    }

    for ((offered, _), result) in accepts.iter().zip(request_results) {
      if let Err(err) = result {
        warn!("{self}: failed to publish request for {}: {err}", offered.name);
      }
    }
  }

  async fn handle_confirm(self: &Arc<Self>, msg: ConfirmConnectionMessage) {
    let Some(handle) = self.base.pending_requests.remove(&msg.plugin_id, &msg.operation_name).await else {
      warn!("{self}: confirm for unknown pending ({}, {})", msg.plugin_id, msg.operation_name);
      return;
    };
    let pending = {
      let mut guard = handle.lock().await;
      guard.input_topic = Some(msg.operation_input_topic.clone());
      guard.close_to_remote_topic = Some(msg.plugin_side_close_topic.clone());
      guard.clone()
    };

    let incoming_close_topic = pending.incoming_close_topic.clone().unwrap_or_default();
    let output_topic = pending.output_topic.clone();
    let operation_name = pending.operation_name.clone();
    let remote_id = pending.remote_id.clone();

    match pending.into_connection() {
      Ok(conn) => {
        if let Err(err) = self
          .base
          .event_bus
          .subscribe(&incoming_close_topic, Arc::new(CoreCloseHandler { core: Arc::downgrade(self) }))
          .await
        {
          warn!("{self}: failed to subscribe close topic: {err}");
        }
        if let Some(output_topic) = &output_topic {
          let sink = self.sink_for(&operation_name).await;
          if let Some(sink) = sink {
            if let Err(err) = self
              .base
              .event_bus
              .subscribe(output_topic, Arc::new(CoreOutputHandler { sink, operation_name: operation_name.clone() }))
              .await
            {
              warn!("{self}: failed to subscribe output topic: {err}");
            }
          }
        }
        self.base.connections.insert(remote_id, operation_name, conn).await;
        self.base.new_connection_added.notify_waiters();
        self.recompute_compliance().await;
      }
      Err(err) => warn!("{self}: dropping incomplete confirm: {err}"),
    }
  }

  async fn sink_for(&self, operation_name: &str) -> Option<crate::operation::Sink> {
    let requirements = self.requirements.lock().await;
    requirements.get(operation_name).and_then(|r| r.override_sink.clone())
  }

  async fn handle_unavailable(&self, msg: OperationNoLongerAvailableMessage) {
    self.base.pending_requests.remove(&msg.plugin_id, &msg.operation_name).await;
    debug!("{self}: {} is no longer available from {}", msg.operation_name, msg.plugin_id);
  }

  /// §4.2's compliance predicate (I3): every requirement's minimum is
  /// met and every mandatory plugin is connected.
  async fn is_compliant(&self) -> bool {
    let requirements = self.requirements.lock().await;
    if requirements.is_empty() {
      return true;
    }
    for (name, requirement) in requirements.iter() {
      let need = self.residual_need(name, requirement).await;
      if need.minimum > 0 || !need.mandatory.is_empty() {
        return false;
      }
    }
    true
  }

  async fn recompute_compliance(&self) {
    let mut compliance = self.compliance.lock().await;
    if *compliance == ComplianceState::Stopped {
      return;
    }
    *compliance = if self.is_compliant().await {
      ComplianceState::Compliant
    } else {
      ComplianceState::NotCompliant
    };
  }

  pub async fn execute_using_plugin(
    &self,
    operation_name: &str,
    plugin_id: &str,
    payload: Option<(Bytes, SchemaSpec)>,
  ) -> Result<(), ProtocolError> {
    let handle = self
      .base
      .connections
      .get(plugin_id, operation_name)
      .await
      .ok_or_else(|| ProtocolError::NoConnection {
        remote_id: plugin_id.to_string(),
        operation_name: operation_name.to_string(),
      })?;
    let mut conn = handle.lock().await;
    // §4.2: a `None` payload requires the input to support empty; a
    // `Some` payload's schema must actually be compatible with the
    // connection's input, not merely non-empty.
    if !conn.accepts(payload.as_ref().map(|(_, schema)| schema)) {
      return Err(ProtocolError::IncompatiblePayload {
        operation_name: operation_name.to_string(),
      });
    }
    conn.touch();
    let topic = conn.input_topic.clone();
    drop(conn);
    let bytes = payload.map(|(bytes, _)| bytes).unwrap_or_default();
    let _ = self.base.event_bus.publish(&topic, bytes).await;
    Ok(())
  }

  /// Connections on `operation_name` whose input accepts `payload_schema`
  /// (`None` meaning "no payload", per `Connection::accepts`).
  async fn compatible_connections(&self, operation_name: &str, payload_schema: Option<&SchemaSpec>) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (remote_id, op, handle) in self.base.connections.snapshot().await {
      if op != operation_name {
        continue;
      }
      let conn = handle.lock().await;
      if conn.accepts(payload_schema) {
        out.push((remote_id, op));
      }
    }
    out
  }

  pub async fn execute_sending_any(&self, operation_name: &str, payload: Option<(Bytes, SchemaSpec)>) {
    let schema = payload.as_ref().map(|(_, schema)| schema.clone());
    let candidates = self.compatible_connections(operation_name, schema.as_ref()).await;
    let Some((remote_id, _)) = candidates.choose(&mut rand::rng()) else {
      warn!("{self}: execute_sending_any({operation_name}): no compatible connection");
      return;
    };
    let _ = self.execute_using_plugin(operation_name, remote_id, payload).await;
  }

  pub async fn execute_sending_all(&self, operation_name: &str, payload: Option<(Bytes, SchemaSpec)>) -> usize {
    let schema = payload.as_ref().map(|(_, schema)| schema.clone());
    let candidates = self.compatible_connections(operation_name, schema.as_ref()).await;
    if candidates.is_empty() {
      warn!("{self}: execute_sending_all({operation_name}): no compatible connection");
      return 0;
    }
    let mut sent = 0;
    for (remote_id, _) in &candidates {
      if self
        .execute_using_plugin(operation_name, remote_id, payload.clone())
        .await
        .is_ok()
      {
        sent += 1;
      }
    }
    sent
  }

  /// Routes each payload to a connection whose input is actually
  /// compatible with that payload's schema (§4.2), round-robining among
  /// the matches when more than one connection accepts the same schema.
  pub async fn execute_distributed(&self, operation_name: &str, payloads: Vec<(Bytes, SchemaSpec)>) -> usize {
    let mut counters: Vec<(SchemaSpec, usize)> = Vec::new();
    let mut sent = 0;
    for (payload, schema) in payloads {
      let candidates = self.compatible_connections(operation_name, Some(&schema)).await;
      if candidates.is_empty() {
        warn!("{self}: execute_distributed({operation_name}): no connection compatible with payload schema");
        continue;
      }

      let idx = match counters.iter().position(|(s, _)| s == &schema) {
        Some(idx) => idx,
        None => {
          counters.push((schema.clone(), 0));
          counters.len() - 1
        }
      };
      let count = counters[idx].1;
      counters[idx].1 += 1;

      let (remote_id, _) = &candidates[count % candidates.len()];
      if self
        .execute_using_plugin(operation_name, remote_id, Some((payload, schema)))
        .await
        .is_ok()
      {
        sent += 1;
      }
    }
    sent
  }
}

impl std::fmt::Display for Core {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.base.identifier)
  }
}

pub struct CoreBuilder {
  identifier: Option<String>,
  event_bus: Arc<dyn crate::eventbus::EventBus>,
  config: RuntimeConfigOrDefault,
  requirements: HashMap<String, OperationRequirement>,
}

enum RuntimeConfigOrDefault {
  Default,
  Custom(crate::config::RuntimeConfig),
}

impl CoreBuilder {
  pub fn new(event_bus: Arc<dyn crate::eventbus::EventBus>) -> Self {
    Self {
      identifier: None,
      event_bus,
      config: RuntimeConfigOrDefault::Default,
      requirements: HashMap::new(),
    }
  }

  pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
    self.identifier = Some(identifier.into());
    self
  }

  pub fn config(mut self, config: crate::config::RuntimeConfig) -> Self {
    self.config = RuntimeConfigOrDefault::Custom(config);
    self
  }

  pub fn requirement(mut self, operation_name: impl Into<String>, requirement: OperationRequirement) -> Self {
    self.requirements.insert(operation_name.into(), requirement);
    self
  }

  pub fn build(self) -> Arc<Core> {
    let identifier = self.identifier.unwrap_or_else(id::new_orbiter_id);
    let config = match self.config {
      RuntimeConfigOrDefault::Default => crate::config::RuntimeConfig::default(),
      RuntimeConfigOrDefault::Custom(c) => c,
    };
    let offer_topic = id::offer_topic(&identifier);
    let response_topic = id::response_topic(&identifier);
    let base = Arc::new(OrbiterCore::with_identifier(identifier, self.event_bus, config));
    Arc::new(Core {
      base,
      requirements: Mutex::new(self.requirements),
      offer_topic,
      response_topic,
      response_subscribed: Mutex::new(false),
      compliance: Mutex::new(ComplianceState::Created),
      loop_handle: Mutex::new(None),
    })
  }
}

struct CoreOfferHandler {
  core: Weak<Core>,
}

#[async_trait::async_trait]
impl EventHandler for CoreOfferHandler {
  async fn on_event(&self, _topic: &str, payload: Bytes) {
    let Some(core) = self.core.upgrade() else { return };
    match serde_json::from_slice::<OfferMessage>(&payload) {
      Ok(msg) => core.handle_offer(msg).await,
      Err(err) => warn!("{core}: malformed OfferMessage: {err}"),
    }
  }
}

struct CoreResponseHandler {
  core: Weak<Core>,
}

#[async_trait::async_trait]
impl EventHandler for CoreResponseHandler {
  async fn on_event(&self, _topic: &str, payload: Bytes) {
    let Some(core) = self.core.upgrade() else { return };
    if let Ok(msg) = serde_json::from_slice::<ConfirmConnectionMessage>(&payload) {
      core.handle_confirm(msg).await;
      return;
    }
    if let Ok(msg) = serde_json::from_slice::<OperationNoLongerAvailableMessage>(&payload) {
      core.handle_unavailable(msg).await;
    }
  }
}

struct CoreKeepaliveHandler {
  core: Weak<Core>,
}

#[async_trait::async_trait]
impl EventHandler for CoreKeepaliveHandler {
  async fn on_event(&self, _topic: &str, payload: Bytes) {
    let Some(core) = self.core.upgrade() else { return };
    if let Ok(msg) = serde_json::from_slice::<KeepaliveMessage>(&payload) {
      core.base.handle_keepalive(&msg).await;
    }
  }
}

struct CoreKeepaliveRequestHandler {
  core: Weak<Core>,
}

#[async_trait::async_trait]
impl EventHandler for CoreKeepaliveRequestHandler {
  async fn on_event(&self, _topic: &str, payload: Bytes) {
    let Some(core) = self.core.upgrade() else { return };
    if let Ok(msg) = serde_json::from_slice::<KeepaliveRequestMessage>(&payload) {
      let _ = core.base.handle_keepalive_request(&msg).await;
    }
  }
}

struct CoreCloseHandler {
  core: Weak<Core>,
}

#[async_trait::async_trait]
impl EventHandler for CoreCloseHandler {
  async fn on_event(&self, _topic: &str, payload: Bytes) {
    let Some(core) = self.core.upgrade() else { return };
    if let Ok(msg) = serde_json::from_slice::<crate::messages::GracefulCloseConnectionMessage>(&payload) {
      let _ = core.base.handle_graceful_close(&msg).await;
      core.recompute_compliance().await;
      return;
    }
    if let Ok(msg) = serde_json::from_slice::<crate::messages::GracelessCloseConnectionMessage>(&payload) {
      core.base.handle_graceless_close(&msg).await;
      core.recompute_compliance().await;
    }
  }
}

struct CoreOutputHandler {
  sink: crate::operation::Sink,
  operation_name: String,
}

#[async_trait::async_trait]
impl EventHandler for CoreOutputHandler {
  async fn on_event(&self, _topic: &str, payload: Bytes) {
    self.sink.on_output("", &self.operation_name, payload).await;
  }
}
