//! [MODULE F] Wire messages (§6.2).
//!
//! Grounded in `orbitalis/events/handshake/{discover,offer,reply,response}.py`,
//! `events/keepalive.py` and `events/close_connection.py`; field names
//! follow §6.2's table rather than the Python drafts' (the drafts carry
//! avro/busline-specific wrapper types we have no counterpart for).

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{id::OrbiterId, policy::Constraint, schema::SchemaSpec};

/// Core → (all plugins): announcement of residual need (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverMessage {
  pub core_id: OrbiterId,
  pub needed_operations: HashMap<String, NeededOperation>,
  pub offer_topic: String,
  pub core_keepalive_topic: String,
  pub core_keepalive_request_topic: String,
  pub consider_me_dead_after_ms: u64,
}

/// A `Constraint` flattened for the wire: allow/block carried as plain
/// id sets so serde doesn't need to know about `AllowBlockList`'s
/// internal mutual-exclusion invariant (re-validated on receipt via
/// `Constraint::new`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeededOperation {
  pub minimum: usize,
  pub maximum: Option<usize>,
  pub mandatory: Vec<OrbiterId>,
  pub inputs: Vec<SchemaSpec>,
  pub outputs: Vec<SchemaSpec>,
  pub allowlist: Option<Vec<OrbiterId>>,
  pub blocklist: Option<Vec<OrbiterId>>,
}

impl NeededOperation {
  pub fn from_constraint(c: &Constraint) -> Self {
    Self {
      minimum: c.minimum,
      maximum: c.maximum,
      mandatory: c.mandatory.clone(),
      inputs: c.inputs.clone(),
      outputs: c.outputs.clone(),
      allowlist: None,
      blocklist: None,
    }
  }

  pub fn from_need(need: &crate::policy::Need) -> Self {
    Self {
      minimum: need.minimum,
      maximum: need.maximum,
      mandatory: need.mandatory.clone(),
      inputs: need.inputs.clone(),
      outputs: need.outputs.clone(),
      allowlist: None,
      blocklist: None,
    }
  }
}

/// Plugin → Core: response to a Discover, listing compatible operations
/// (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferMessage {
  pub plugin_id: OrbiterId,
  pub offered_operations: Vec<OfferedOperation>,
  pub reply_topic: String,
  pub plugin_keepalive_topic: String,
  pub plugin_keepalive_request_topic: String,
  pub consider_me_dead_after_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferedOperation {
  pub name: String,
  pub input: SchemaSpec,
  pub output: SchemaSpec,
}

/// Core → Plugin, on the plugin's `reply_topic`: one per chosen
/// operation (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestOperationMessage {
  pub core_id: OrbiterId,
  pub operation_name: String,
  pub response_topic: String,
  pub output_topic: Option<String>,
  pub core_side_close_topic: String,
  #[serde(with = "opt_bytes")]
  pub setup_data: Option<Bytes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectOperationMessage {
  pub core_id: OrbiterId,
  pub operation_name: String,
}

/// Plugin → Core, on the core's `response_topic`: accepts a Request
/// (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmConnectionMessage {
  pub plugin_id: OrbiterId,
  pub operation_name: String,
  pub operation_input_topic: String,
  pub plugin_side_close_topic: String,
}

/// Plugin → Core: preemptive notice that an operation the plugin
/// offered is no longer available, sent when a Request arrives for an
/// operation this plugin cannot or will not honor (Open Question #2,
/// resolved: send preemptively rather than dropping silently — see
/// SPEC_FULL.md).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationNoLongerAvailableMessage {
  pub plugin_id: OrbiterId,
  pub operation_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GracelessCloseConnectionMessage {
  pub from_id: OrbiterId,
  pub operation_name: String,
  #[serde(with = "opt_bytes")]
  pub data: Option<Bytes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GracefulCloseConnectionMessage {
  pub from_id: OrbiterId,
  pub operation_name: String,
  pub ack_topic: String,
  #[serde(with = "opt_bytes")]
  pub data: Option<Bytes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseConnectionAckMessage {
  pub from_id: OrbiterId,
  pub operation_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveMessage {
  pub from_id: OrbiterId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveRequestMessage {
  pub from_id: OrbiterId,
  pub keepalive_topic: String,
}

/// `Bytes` doesn't implement `Serialize`/`Deserialize` directly in a way
/// that plays well with `Option`; go through a plain `Vec<u8>` view.
mod opt_bytes {
  use bytes::Bytes;
  use serde::{Deserialize, Deserializer, Serialize, Serializer};

  pub fn serialize<S: Serializer>(value: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error> {
    value.as_ref().map(|b| b.as_ref()).serialize(serializer)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Bytes>, D::Error> {
    let raw: Option<Vec<u8>> = Option::deserialize(deserializer)?;
    Ok(raw.map(Bytes::from))
  }
}
