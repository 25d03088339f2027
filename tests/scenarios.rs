//! End-to-end scenarios (spec §8 S1-S6, B1, B3, B4) driven entirely
//! over `LocalEventBus`. Since `LocalEventBus::publish` invokes the
//! subscribed handler inline, a full Discover -> Offer -> Request ->
//! Confirm round trip completes synchronously inside `Core::start()`
//! and `Core::execute_*` calls — most scenarios need no sleeps at all.
//! The handful that are explicitly about elapsed time (S4's reconnect,
//! S5's expiry sweep, S6's dead-peer detection) use short real-time
//! configs and a real `tokio::time::sleep`, sized so the assertion
//! runs inside the single periodic-loop tick under test and before any
//! subsequent tick could change the outcome again.

use std::{
  sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
  },
  time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use orbitalis::{
  core::ComplianceState, AllowBlockList, Connection, ConnectionFilter, Constraint, Core, EventBus, LocalEventBus,
  Operation, OperationHandler, OperationRequirement, OutputSink, PendingRequest, Plugin, Policy, RuntimeConfig,
  SchemaSpec, Sink,
};

struct Toggle {
  on: Arc<AtomicBool>,
  value: bool,
}

#[async_trait]
impl OperationHandler for Toggle {
  async fn handle(&self, _payload: Option<Bytes>) -> Option<Bytes> {
    self.on.store(self.value, Ordering::SeqCst);
    None
  }
}

struct Status {
  on: Arc<AtomicBool>,
}

#[async_trait]
impl OperationHandler for Status {
  async fn handle(&self, _payload: Option<Bytes>) -> Option<Bytes> {
    let text = if self.on.load(Ordering::SeqCst) { "on" } else { "off" };
    Some(Bytes::from_static(text.as_bytes()))
  }
}

struct NoOpHandler;

#[async_trait]
impl OperationHandler for NoOpHandler {
  async fn handle(&self, _payload: Option<Bytes>) -> Option<Bytes> {
    None
  }
}

struct RecordingHandler {
  received: Arc<std::sync::Mutex<Vec<Bytes>>>,
}

#[async_trait]
impl OperationHandler for RecordingHandler {
  async fn handle(&self, payload: Option<Bytes>) -> Option<Bytes> {
    if let Some(payload) = payload {
      self.received.lock().unwrap().push(payload);
    }
    None
  }
}

struct RecordingSink {
  last: Arc<std::sync::Mutex<Option<Bytes>>>,
}

#[async_trait]
impl OutputSink for RecordingSink {
  async fn on_output(&self, _remote_id: &str, _operation_name: &str, payload: Bytes) {
    *self.last.lock().unwrap() = Some(payload);
  }
}

fn constraint(min: usize, max: Option<usize>, mandatory: Vec<String>) -> Constraint {
  Constraint::new(min, max, mandatory, vec![SchemaSpec::Empty], vec![SchemaSpec::Empty], AllowBlockList::unrestricted()).unwrap()
}

/// S1 - single-core single-plugin happy path.
#[tokio::test]
async fn single_core_single_plugin_happy_path() {
  let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
  let on = Arc::new(AtomicBool::new(false));

  let plugin = Plugin::builder(bus.clone())
    .identifier("plugin-x")
    .operation(Operation::new(
      "turn_on",
      SchemaSpec::Empty,
      SchemaSpec::Empty,
      Arc::new(Toggle { on: on.clone(), value: true }),
      Policy::default(),
    ))
    .operation(Operation::new(
      "turn_off",
      SchemaSpec::Empty,
      SchemaSpec::Empty,
      Arc::new(Toggle { on: on.clone(), value: false }),
      Policy::default(),
    ))
    .operation(Operation::new(
      "get_status",
      SchemaSpec::Empty,
      SchemaSpec::from_schema("\"String\""),
      Arc::new(Status { on: on.clone() }),
      Policy::default(),
    ))
    .build();
  plugin.start().await.unwrap();

  let core = Core::builder(bus.clone())
    .identifier("core-h")
    .requirement("turn_on", OperationRequirement::new(constraint(1, None, vec!["plugin-x".into()])))
    .requirement("turn_off", OperationRequirement::new(constraint(1, None, vec!["plugin-x".into()])))
    .requirement("get_status", OperationRequirement::new(constraint(1, None, vec!["plugin-x".into()])))
    .build();
  core.start().await.unwrap();

  assert_eq!(core.compliance().await, ComplianceState::Compliant);

  core.execute_using_plugin("turn_on", "plugin-x", None).await.unwrap();
  assert!(on.load(Ordering::SeqCst));

  let conns = core.retrieve_connections(&ConnectionFilter::default()).await;
  assert_eq!(conns.len(), 3);
}

/// S2 - allowlist exclusion.
#[tokio::test]
async fn allowlist_excludes_the_other_core() {
  let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());

  let plugin = Plugin::builder(bus.clone())
    .identifier("plugin-x")
    .operation(Operation::new(
      "turn_on",
      SchemaSpec::Empty,
      SchemaSpec::Empty,
      Arc::new(NoOpHandler),
      Policy::new(AllowBlockList::allow_only("smart_home_1"), None),
    ))
    .build();
  plugin.start().await.unwrap();

  let home_1 = Core::builder(bus.clone())
    .identifier("smart_home_1")
    .requirement("turn_on", OperationRequirement::new(constraint(1, None, vec![])))
    .build();
  home_1.start().await.unwrap();

  let home_2 = Core::builder(bus.clone())
    .identifier("smart_home_2")
    .requirement("turn_on", OperationRequirement::new(constraint(1, None, vec![])))
    .build();
  home_2.start().await.unwrap();

  assert_eq!(home_1.compliance().await, ComplianceState::Compliant);
  assert_eq!(home_2.compliance().await, ComplianceState::NotCompliant);
  assert!(home_2.retrieve_connections(&ConnectionFilter::default()).await.is_empty());
}

/// S3 - dynamic input dispatch via `execute_distributed`: a payload is
/// routed to the connection whose input schema it actually matches, not
/// just any connection with room for a payload.
#[tokio::test]
async fn execute_distributed_routes_payloads_to_the_matching_schema() {
  let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
  let int_schema = SchemaSpec::from_schema("\"Int64\"");
  let string_schema = SchemaSpec::from_schema("\"String\"");

  let int_received = Arc::new(std::sync::Mutex::new(Vec::new()));
  let plugin_int = Plugin::builder(bus.clone())
    .identifier("plugin-int")
    .operation(Operation::new(
      "save",
      int_schema.clone(),
      SchemaSpec::Empty,
      Arc::new(RecordingHandler { received: int_received.clone() }),
      Policy::default(),
    ))
    .build();
  plugin_int.start().await.unwrap();

  let string_received = Arc::new(std::sync::Mutex::new(Vec::new()));
  let plugin_string = Plugin::builder(bus.clone())
    .identifier("plugin-string")
    .operation(Operation::new(
      "save",
      string_schema.clone(),
      SchemaSpec::Empty,
      Arc::new(RecordingHandler { received: string_received.clone() }),
      Policy::default(),
    ))
    .build();
  plugin_string.start().await.unwrap();

  let core = Core::builder(bus.clone())
    .identifier("core-h")
    .requirement(
      "save",
      OperationRequirement::new(
        Constraint::new(
          2,
          None,
          vec![],
          vec![int_schema.clone(), string_schema.clone()],
          vec![SchemaSpec::Empty],
          AllowBlockList::unrestricted(),
        )
        .unwrap(),
      ),
    )
    .build();
  core.start().await.unwrap();

  assert_eq!(core.compliance().await, ComplianceState::Compliant);

  let sent = core
    .execute_distributed(
      "save",
      vec![
        (Bytes::from_static(b"42"), int_schema),
        (Bytes::from_static(b"\"hello\""), string_schema),
      ],
    )
    .await;
  assert_eq!(sent, 2);

  assert_eq!(int_received.lock().unwrap().as_slice(), [Bytes::from_static(b"42")]);
  assert_eq!(string_received.lock().unwrap().as_slice(), [Bytes::from_static(b"\"hello\"")]);
}

/// S4 - graceful close + reconnect. The plugin initiates the close;
/// the core observes the empty slot, goes NOT_COMPLIANT, and its own
/// periodic loop re-discovers, reconnecting with fresh topic suffixes.
#[tokio::test]
async fn graceful_close_then_reconnect() {
  let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
  let config = RuntimeConfig::builder().loop_interval(Duration::from_millis(20)).build();

  let plugin = Plugin::builder(bus.clone())
    .identifier("plugin-x")
    .config(config.clone())
    .operation(Operation::new("turn_on", SchemaSpec::Empty, SchemaSpec::Empty, Arc::new(NoOpHandler), Policy::default()))
    .build();
  plugin.start().await.unwrap();

  let core = Core::builder(bus.clone())
    .identifier("core-h")
    .config(config)
    .requirement("turn_on", OperationRequirement::new(constraint(1, None, vec!["plugin-x".into()])))
    .build();
  core.start().await.unwrap();
  assert_eq!(core.compliance().await, ComplianceState::Compliant);

  let filter = ConnectionFilter {
    remote_id: Some("plugin-x".to_string()),
    operation_name: Some("turn_on".to_string()),
    ..Default::default()
  };
  let before = core.retrieve_connections(&filter).await;
  assert_eq!(before.len(), 1);
  let old_input_topic = before[0].input_topic.clone();

  plugin.base.send_graceful_close_connection("core-h", "turn_on", None).await.unwrap();
  assert!(core.retrieve_connections(&filter).await.is_empty());
  assert_eq!(core.compliance().await, ComplianceState::NotCompliant);

  // One periodic tick (20ms) is enough for the core to re-discover and
  // complete a fresh handshake, since the whole chain runs synchronously
  // inside `LocalEventBus::publish`.
  tokio::time::sleep(Duration::from_millis(100)).await;

  let after: Vec<Connection> = core.retrieve_connections(&filter).await;
  assert_eq!(after.len(), 1);
  assert_ne!(after[0].input_topic, old_input_topic);
  assert_eq!(core.compliance().await, ComplianceState::Compliant);

  core.stop().await.unwrap();
  plugin.stop().await.unwrap();
}

/// B3 - a PendingRequest older than `pendingRequestsExpireAfter` is
/// dropped by the next loop tick.
#[tokio::test]
async fn stale_pending_request_is_swept_by_the_loop() {
  let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
  let config = RuntimeConfig::builder()
    .loop_interval(Duration::from_millis(20))
    .pending_requests_expire_after(Duration::from_millis(50))
    .build();

  let core = Core::builder(bus.clone()).identifier("core-h").config(config).build();

  let mut stale = PendingRequest::new("turn_on", "plugin-x".to_string());
  stale.created_at = Utc::now() - ChronoDuration::seconds(5);
  core.base.pending_requests.insert("plugin-x".to_string(), "turn_on", stale).await;
  assert!(!core.base.pending_requests.is_empty().await);

  core.start().await.unwrap();
  tokio::time::sleep(Duration::from_millis(100)).await;

  assert!(core.base.pending_requests.is_empty().await);
  core.stop().await.unwrap();
}

/// S5 (idle-close half) - a Connection idle for longer than
/// `closeConnectionIfUnusedAfter` is closed by the loop. Only the core
/// side is configured to notice idleness, and the check runs before a
/// second tick could re-discover and reconnect, so the observation is
/// deterministic.
#[tokio::test]
async fn idle_connection_is_closed_by_the_loop() {
  let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());

  let plugin = Plugin::builder(bus.clone())
    .identifier("plugin-x")
    .operation(Operation::new("turn_on", SchemaSpec::Empty, SchemaSpec::Empty, Arc::new(NoOpHandler), Policy::default()))
    .build();
  plugin.start().await.unwrap();

  let core_config = RuntimeConfig::builder()
    .loop_interval(Duration::from_millis(150))
    .close_connection_if_unused_after(Duration::from_millis(30))
    .build();
  let core = Core::builder(bus.clone())
    .identifier("core-h")
    .config(core_config)
    .requirement("turn_on", OperationRequirement::new(constraint(1, None, vec!["plugin-x".into()])))
    .build();
  core.start().await.unwrap();
  assert_eq!(core.compliance().await, ComplianceState::Compliant);

  // First tick at ~150ms: idle_for() (~150ms) exceeds the 30ms
  // threshold, closing the connection on both sides. Checked well
  // before the second tick at ~300ms could re-discover.
  tokio::time::sleep(Duration::from_millis(220)).await;

  assert!(core.retrieve_connections(&ConnectionFilter::default()).await.is_empty());
  assert_eq!(core.compliance().await, ComplianceState::NotCompliant);
  assert!(plugin.base.connections.is_empty().await);

  core.stop().await.unwrap();
  plugin.stop().await.unwrap();
}

/// S6 - peer death detection.
#[tokio::test]
async fn dead_remote_is_observed_after_silence() {
  let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
  let plugin = Plugin::builder(bus.clone()).identifier("plugin-x").build();

  plugin.base.note_seen("core-h").await;
  plugin.base.note_dead_after("core-h", Duration::from_millis(1)).await;

  tokio::time::sleep(Duration::from_millis(20)).await;
  assert!(plugin.base.dead_remote_ids().await.contains(&"core-h".to_string()));
}

/// B1 - allowlist boundary: offer reaches only the allowed core.
#[tokio::test]
async fn b1_allowlist_boundary() {
  let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
  let plugin = Plugin::builder(bus.clone())
    .identifier("plugin-x")
    .operation(Operation::new(
      "turn_on",
      SchemaSpec::Empty,
      SchemaSpec::Empty,
      Arc::new(NoOpHandler),
      Policy::new(AllowBlockList::allow_only("smart_home_1"), None),
    ))
    .build();
  plugin.start().await.unwrap();

  let allowed = Core::builder(bus.clone())
    .identifier("smart_home_1")
    .requirement("turn_on", OperationRequirement::new(constraint(1, None, vec![])))
    .build();
  allowed.start().await.unwrap();
  assert!(!allowed.retrieve_connections(&ConnectionFilter::default()).await.is_empty());
}

/// B4 - a plugin with `maximum=2` never offers a third core a connection.
#[tokio::test]
async fn b4_maximum_cardinality_excludes_third_core() {
  let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
  let plugin = Plugin::builder(bus.clone())
    .identifier("plugin-x")
    .operation(Operation::new(
      "turn_on",
      SchemaSpec::Empty,
      SchemaSpec::Empty,
      Arc::new(NoOpHandler),
      Policy::new(AllowBlockList::unrestricted(), Some(2)),
    ))
    .build();
  plugin.start().await.unwrap();

  let core_a = Core::builder(bus.clone())
    .identifier("core-a")
    .requirement("turn_on", OperationRequirement::new(constraint(1, None, vec![])))
    .build();
  core_a.start().await.unwrap();

  let core_b = Core::builder(bus.clone())
    .identifier("core-b")
    .requirement("turn_on", OperationRequirement::new(constraint(1, None, vec![])))
    .build();
  core_b.start().await.unwrap();

  let core_c = Core::builder(bus.clone())
    .identifier("core-c")
    .requirement("turn_on", OperationRequirement::new(constraint(1, None, vec![])))
    .build();
  core_c.start().await.unwrap();

  assert_eq!(core_a.compliance().await, ComplianceState::Compliant);
  assert_eq!(core_b.compliance().await, ComplianceState::Compliant);
  assert_eq!(core_c.compliance().await, ComplianceState::NotCompliant);
  assert!(core_c.retrieve_connections(&ConnectionFilter::default()).await.is_empty());
}

/// A core's override sink (Open Question #3: override wins) receives
/// every output event published on the connection's output topic.
#[tokio::test]
async fn override_sink_receives_operation_output() {
  let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
  let on = Arc::new(AtomicBool::new(true));
  let plugin = Plugin::builder(bus.clone())
    .identifier("plugin-x")
    .operation(Operation::new(
      "get_status",
      SchemaSpec::Empty,
      SchemaSpec::from_schema("\"String\""),
      Arc::new(Status { on: on.clone() }),
      Policy::default(),
    ))
    .build();
  plugin.start().await.unwrap();

  let last = Arc::new(std::sync::Mutex::new(None));
  let sink: Sink = Arc::new(RecordingSink { last: last.clone() });

  let core = Core::builder(bus.clone())
    .identifier("core-h")
    .requirement(
      "get_status",
      OperationRequirement::new(
        Constraint::new(
          1,
          None,
          vec![],
          vec![SchemaSpec::Empty],
          vec![SchemaSpec::from_schema("\"String\"")],
          AllowBlockList::unrestricted(),
        )
        .unwrap(),
      )
      .with_override_sink(sink),
    )
    .build();
  core.start().await.unwrap();

  core.execute_using_plugin("get_status", "plugin-x", None).await.unwrap();
  assert_eq!(last.lock().unwrap().clone(), Some(Bytes::from_static(b"on")));
}

/// Regression check for the parallel `handle_offer` fan-out: every
/// required operation a plugin offers ends up with exactly one
/// connection, not zero or duplicated.
#[tokio::test]
async fn parallel_offer_fanout_yields_exactly_one_connection_per_operation() {
  let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
  let calls = Arc::new(AtomicUsize::new(0));

  struct Counting {
    calls: Arc<AtomicUsize>,
  }
  #[async_trait]
  impl OperationHandler for Counting {
    async fn handle(&self, _payload: Option<Bytes>) -> Option<Bytes> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      None
    }
  }

  let plugin = Plugin::builder(bus.clone())
    .identifier("plugin-x")
    .operation(Operation::new(
      "turn_on",
      SchemaSpec::Empty,
      SchemaSpec::Empty,
      Arc::new(Counting { calls: calls.clone() }),
      Policy::default(),
    ))
    .operation(Operation::new(
      "turn_off",
      SchemaSpec::Empty,
      SchemaSpec::Empty,
      Arc::new(Counting { calls: calls.clone() }),
      Policy::default(),
    ))
    .build();
  plugin.start().await.unwrap();

  let core = Core::builder(bus.clone())
    .identifier("core-h")
    .requirement("turn_on", OperationRequirement::new(constraint(1, None, vec![])))
    .requirement("turn_off", OperationRequirement::new(constraint(1, None, vec![])))
    .build();
  core.start().await.unwrap();

  let conns = core.retrieve_connections(&ConnectionFilter::default()).await;
  assert_eq!(conns.len(), 2);

  core.execute_using_plugin("turn_on", "plugin-x", None).await.unwrap();
  core.execute_using_plugin("turn_off", "plugin-x", None).await.unwrap();
  assert_eq!(calls.load(Ordering::SeqCst), 2);
}
