//! Generic `remote_id -> operation_name -> T` registry (§3, §9).
//!
//! Used for both the pending-request table and the connection table.
//! Each entry gets its own `tokio::sync::Mutex` so handshake steps for
//! different `(remote_id, operation_name)` pairs never block each
//! other; a single outer `Mutex` guards structural changes to the map
//! itself (insert/remove), matching the "per-entry lock plus a
//! registry-level lock for structural changes" shape used throughout
//! the pending-request/connection machinery described in
//! `orbiter/connection.py` and `orbiter/pending_request.py`.

use std::{
  collections::HashMap,
  sync::Arc,
};

use tokio::sync::Mutex;

use crate::id::OrbiterId;

/// Thread-safe `(remote_id, operation_name)`-keyed store of `Arc<Mutex<T>>`.
pub struct EntryRegistry<T> {
  entries: Mutex<HashMap<OrbiterId, HashMap<String, Arc<Mutex<T>>>>>,
}

impl<T> Default for EntryRegistry<T> {
  fn default() -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
    }
  }
}

impl<T> EntryRegistry<T> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Insert a new entry, returning the previous one (if any) still
  /// wrapped in its own `Arc<Mutex<_>>` so in-flight holders of the old
  /// handle keep working against it.
  pub async fn insert(&self, remote_id: OrbiterId, operation_name: impl Into<String>, value: T) -> Option<Arc<Mutex<T>>> {
    let mut entries = self.entries.lock().await;
    entries
      .entry(remote_id)
      .or_default()
      .insert(operation_name.into(), Arc::new(Mutex::new(value)))
  }

  pub async fn get(&self, remote_id: &str, operation_name: &str) -> Option<Arc<Mutex<T>>> {
    let entries = self.entries.lock().await;
    entries.get(remote_id).and_then(|by_op| by_op.get(operation_name)).cloned()
  }

  pub async fn remove(&self, remote_id: &str, operation_name: &str) -> Option<Arc<Mutex<T>>> {
    let mut entries = self.entries.lock().await;
    let removed = entries.get_mut(remote_id).and_then(|by_op| by_op.remove(operation_name));
    if let Some(by_op) = entries.get(remote_id) {
      if by_op.is_empty() {
        entries.remove(remote_id);
      }
    }
    removed
  }

  pub async fn contains(&self, remote_id: &str, operation_name: &str) -> bool {
    let entries = self.entries.lock().await;
    entries
      .get(remote_id)
      .map(|by_op| by_op.contains_key(operation_name))
      .unwrap_or(false)
  }

  /// Number of entries currently registered for `operation_name`,
  /// across all remotes — used to evaluate cardinality limits (I4).
  pub async fn count_for_operation(&self, operation_name: &str) -> usize {
    let entries = self.entries.lock().await;
    entries
      .values()
      .filter(|by_op| by_op.contains_key(operation_name))
      .count()
  }

  pub async fn remote_ids_for_operation(&self, operation_name: &str) -> Vec<OrbiterId> {
    let entries = self.entries.lock().await;
    entries
      .iter()
      .filter(|(_, by_op)| by_op.contains_key(operation_name))
      .map(|(remote_id, _)| remote_id.clone())
      .collect()
  }

  /// A flat snapshot of every `(remote_id, operation_name, handle)`
  /// triple, for periodic sweeps (expiry, idle close, keepalive).
  pub async fn snapshot(&self) -> Vec<(OrbiterId, String, Arc<Mutex<T>>)> {
    let entries = self.entries.lock().await;
    entries
      .iter()
      .flat_map(|(remote_id, by_op)| {
        by_op
          .iter()
          .map(move |(operation_name, handle)| (remote_id.clone(), operation_name.clone(), handle.clone()))
      })
      .collect()
  }

  pub async fn len(&self) -> usize {
    let entries = self.entries.lock().await;
    entries.values().map(|by_op| by_op.len()).sum()
  }

  pub async fn is_empty(&self) -> bool {
    self.len().await == 0
  }
}
