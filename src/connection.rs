//! Connection and PendingRequest (§3): the two states a
//! `(remote_id, operation_name)` pair passes through during and after
//! the handshake.

use chrono::{DateTime, Utc};

use crate::{error::ProtocolError, id::OrbiterId, schema::SchemaSpec};

/// A reservation created when either role has sent a protocol message
/// and is waiting for the counterpart (§3). Fields are progressively
/// filled in as the handshake advances; `into_connection` validates
/// that everything required is present before promotion.
#[derive(Debug, Clone)]
pub struct PendingRequest {
  pub operation_name: String,
  pub remote_id: OrbiterId,
  pub created_at: DateTime<Utc>,

  pub input: Option<SchemaSpec>,
  pub output: Option<SchemaSpec>,

  pub input_topic: Option<String>,
  pub output_topic: Option<String>,
  pub incoming_close_topic: Option<String>,
  pub close_to_remote_topic: Option<String>,
}

impl PendingRequest {
  pub fn new(operation_name: impl Into<String>, remote_id: OrbiterId) -> Self {
    Self {
      operation_name: operation_name.into(),
      remote_id,
      created_at: Utc::now(),
      input: None,
      output: None,
      input_topic: None,
      output_topic: None,
      incoming_close_topic: None,
      close_to_remote_topic: None,
    }
  }

  pub fn age(&self) -> chrono::Duration {
    Utc::now() - self.created_at
  }

  /// Promote a fully-populated PendingRequest to a Connection. Ownership
  /// of the topic strings transfers atomically here (§9: "Own the
  /// strings in the PendingRequest until promotion; transfer ownership
  /// to the Connection atomically").
  pub fn into_connection(self) -> Result<Connection, ProtocolError> {
    let incomplete = |reason: &str| ProtocolError::IncompletePendingRequest {
      remote_id: self.remote_id.clone(),
      operation_name: self.operation_name.clone(),
      reason: reason.to_string(),
    };

    let input_topic = self.input_topic.ok_or_else(|| incomplete("input_topic missing"))?;
    let input = self.input.ok_or_else(|| incomplete("input schema missing"))?;
    let incoming_close_topic = self
      .incoming_close_topic
      .ok_or_else(|| incomplete("incoming_close_topic missing"))?;
    let close_to_remote_topic = self
      .close_to_remote_topic
      .ok_or_else(|| incomplete("close_to_remote_topic missing"))?;

    let output = self.output.unwrap_or(SchemaSpec::Empty);
    // Invariant I2: outputTopic is set iff output is not "no-output".
    if self.output_topic.is_some() != !matches!(output, SchemaSpec::Empty) {
      return Err(incomplete("output_topic / output schema disagree on no-output-ness"));
    }

    let now = Utc::now();
    Ok(Connection {
      operation_name: self.operation_name,
      remote_id: self.remote_id,
      input,
      output,
      input_topic,
      output_topic: self.output_topic,
      incoming_close_topic,
      close_to_remote_topic,
      created_at: now,
      last_use: now,
    })
  }
}

/// The established bidirectional channel for one `(remote_id,
/// operation_name)` pair (§3).
#[derive(Debug, Clone)]
pub struct Connection {
  pub operation_name: String,
  pub remote_id: OrbiterId,

  pub input: SchemaSpec,
  pub output: SchemaSpec,

  pub input_topic: String,
  pub output_topic: Option<String>,
  pub incoming_close_topic: String,
  pub close_to_remote_topic: String,

  pub created_at: DateTime<Utc>,
  pub last_use: DateTime<Utc>,
}

impl Connection {
  pub fn touch(&mut self) {
    self.last_use = Utc::now();
  }

  pub fn idle_for(&self) -> chrono::Duration {
    Utc::now() - self.last_use
  }

  /// Whether a payload (or its absence) is acceptable on this
  /// connection's input, per the compatibility check used by
  /// `execute*` (§4.2): a `None` payload requires the input to support
  /// empty; otherwise the input spec must be compatible with the
  /// payload's schema.
  pub fn accepts(&self, payload_schema: Option<&SchemaSpec>) -> bool {
    match payload_schema {
      None => self.input.supports_empty(),
      Some(schema) => self.input.is_compatible(schema, false, false),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn filled_pending() -> PendingRequest {
    let mut pr = PendingRequest::new("turn_on", "plugin-x".to_string());
    pr.input = Some(SchemaSpec::Empty);
    pr.output = Some(SchemaSpec::Empty);
    pr.input_topic = Some("turn_on.core.plugin.input.1".to_string());
    pr.incoming_close_topic = Some("turn_on.core.plugin.close.1".to_string());
    pr.close_to_remote_topic = Some("turn_on.plugin.core.close.1".to_string());
    pr
  }

  #[test]
  fn promotes_to_connection_when_complete() {
    let conn = filled_pending().into_connection().unwrap();
    assert_eq!(conn.operation_name, "turn_on");
    assert!(conn.output_topic.is_none());
  }

  #[test]
  fn rejects_promotion_when_input_topic_missing() {
    let mut pr = filled_pending();
    pr.input_topic = None;
    assert!(pr.into_connection().is_err());
  }

  #[test]
  fn rejects_promotion_when_output_topic_disagrees_with_schema() {
    let mut pr = filled_pending();
    pr.output_topic = Some("turn_on.core.plugin.output.1".to_string());
    // output schema is still Empty => invariant I2 violated
    assert!(pr.into_connection().is_err());
  }

  #[test]
  fn connection_accepts_matches_invariant() {
    let mut pr = filled_pending();
    pr.input = Some(SchemaSpec::from_schema("\"Int64\""));
    let conn = pr.into_connection().unwrap();
    assert!(!conn.accepts(None));
    assert!(conn.accepts(Some(&SchemaSpec::from_schema("\"Int64\""))));
    assert!(!conn.accepts(Some(&SchemaSpec::from_schema("\"String\""))));
  }
}
