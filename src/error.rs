use thiserror::Error;

/// Errors raised at Constraint construction time.
///
/// These are programmer errors (§7): an invalid Constraint is fatal at
/// construction, not something the handshake is expected to recover from.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConstraintError {
  #[error("minimum ({minimum}) exceeds maximum ({maximum})")]
  MinimumExceedsMaximum { minimum: usize, maximum: usize },

  #[error("mandatory set ({mandatory}) exceeds maximum ({maximum})")]
  MandatoryExceedsMaximum { mandatory: usize, maximum: usize },

  #[error("constraint must list at least one input schema spec")]
  EmptyInputs,

  #[error("constraint must list at least one output schema spec")]
  EmptyOutputs,

  #[error(transparent)]
  Policy(#[from] PolicyError),
}

/// Errors raised at Policy / AllowBlockList construction time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
  #[error("allowlist and blocklist are mutually exclusive")]
  AllowAndBlockList,
}

/// Transport-layer failures (§7, "Transport error"): publish, subscribe,
/// unsubscribe. Any speculative state the caller mutated before the
/// failing call must be rolled back by the caller; this type only
/// carries the failure itself.
#[derive(Debug, Error)]
pub enum TransportError {
  #[error("publish to '{topic}' failed: {reason}")]
  Publish { topic: String, reason: String },

  #[error("subscribe to '{topic}' failed: {reason}")]
  Subscribe { topic: String, reason: String },

  #[error("unsubscribe from '{topic}' failed: {reason}")]
  Unsubscribe { topic: String, reason: String },

  #[error("event bus connect failed: {0}")]
  Connect(String),
}

/// Runtime protocol errors: violations the engine detects while handling
/// an incoming wire message or servicing an `execute*` call. Per §7 these
/// are logged at WARN and the offending message/call is dropped; they
/// are returned here so callers (and tests) can observe the same
/// decision without scraping logs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
  #[error("no pending request for ({remote_id}, {operation_name})")]
  NoPendingRequest { remote_id: String, operation_name: String },

  #[error("no connection for ({remote_id}, {operation_name})")]
  NoConnection { remote_id: String, operation_name: String },

  #[error("payload is not schema-compatible with connection input for operation {operation_name}")]
  IncompatiblePayload { operation_name: String },

  #[error("pending request for ({remote_id}, {operation_name}) is incomplete: {reason}")]
  IncompletePendingRequest {
    remote_id: String,
    operation_name: String,
    reason: String,
  },
}

/// The crate's top-level error type.
#[derive(Debug, Error)]
pub enum OrbiterError {
  #[error(transparent)]
  Constraint(#[from] ConstraintError),

  #[error(transparent)]
  Policy(#[from] PolicyError),

  #[error(transparent)]
  Transport(#[from] TransportError),

  #[error(transparent)]
  Protocol(#[from] ProtocolError),
}

pub type Result<T, E = OrbiterError> = std::result::Result<T, E>;
