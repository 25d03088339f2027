//! Orbiter identity and well-known topic shapes (§3, §6.3).

use uuid::Uuid;

/// Stable identifier of an Orbiter. A UUID-like string, generated fresh
/// at construction unless the caller supplies one explicitly.
pub type OrbiterId = String;

/// Generate a fresh Orbiter identifier.
pub fn new_orbiter_id() -> OrbiterId {
  Uuid::new_v4().to_string()
}

/// Generate a fresh, collision-resistant topic suffix. Every topic other
/// than the two reserved keepalive shapes is minted with one of these so
/// that late messages belonging to a torn-down connection can never be
/// mistaken for messages on a newly (re)established one (§3, §4.7).
pub fn fresh_suffix() -> String {
  Uuid::new_v4().simple().to_string()
}

/// The well-known, globally shared discover topic all Cores publish to.
pub const DISCOVER_TOPIC: &str = "$handshake.discover";

pub fn offer_topic(core_id: &str) -> String {
  format!("handshake/{core_id}/offer/{}", fresh_suffix())
}

pub fn reply_topic(plugin_id: &str) -> String {
  format!("handshake/{plugin_id}/reply")
}

pub fn response_topic(core_id: &str) -> String {
  format!("handshake/{core_id}/response")
}

pub fn input_topic(operation_name: &str, core_id: &str, plugin_id: &str) -> String {
  format!("{operation_name}.{core_id}.{plugin_id}.input.{}", fresh_suffix())
}

pub fn output_topic(operation_name: &str, core_id: &str, plugin_id: &str) -> String {
  format!("{operation_name}.{core_id}.{plugin_id}.output.{}", fresh_suffix())
}

pub fn close_topic(operation_name: &str, owner_id: &str, peer_id: &str) -> String {
  format!("{operation_name}.{owner_id}.{peer_id}.close.{}", fresh_suffix())
}

pub fn close_ack_topic(operation_name: &str, owner_id: &str, peer_id: &str) -> String {
  format!(
    "{operation_name}.{owner_id}.{peer_id}.close.ack.{}",
    fresh_suffix()
  )
}

pub fn keepalive_topic(id: &str) -> String {
  format!("$keepalive.{id}")
}

pub fn keepalive_request_topic(id: &str) -> String {
  format!("$keepalive.{id}.request")
}
