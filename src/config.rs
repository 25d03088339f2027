//! Per-Orbiter runtime tunables (§5), built via a `QosPolicyBuilder`-
//! style builder.

use std::time::Duration;

/// Timing knobs shared by Core and Plugin orbiters.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
  /// Period between ticks of the periodic loop (discover re-emission,
  /// expiry sweep, keepalive send).
  pub loop_interval: Duration,
  /// A PendingRequest older than this is dropped by the loop (B3).
  pub pending_requests_expire_after: Duration,
  /// If set, a Connection idle for longer than this is closed by the
  /// loop (opt-in, §5).
  pub close_connection_if_unused_after: Option<Duration>,
  /// Advertised in outbound Discover/Offer messages; the receiving
  /// side uses it to populate `deadRemoteIds`.
  pub consider_me_dead_after: Duration,
  /// Timeout for a graceful close's ack round-trip before falling back
  /// to unilateral teardown (§4.7).
  pub graceful_close_timeout: Duration,
  /// Plugin-side TTL for an unanswered Offer (Open Question #1,
  /// resolved: adopted — see SPEC_FULL.md). `None` disables the
  /// timeout, relying solely on the core-side pending-request expiry.
  pub offer_expires_after: Option<Duration>,
}

impl RuntimeConfig {
  pub fn builder() -> RuntimeConfigBuilder {
    RuntimeConfigBuilder::default()
  }
}

impl Default for RuntimeConfig {
  fn default() -> Self {
    RuntimeConfigBuilder::default().build()
  }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfigBuilder {
  loop_interval: Duration,
  pending_requests_expire_after: Duration,
  close_connection_if_unused_after: Option<Duration>,
  consider_me_dead_after: Duration,
  graceful_close_timeout: Duration,
  offer_expires_after: Option<Duration>,
}

impl Default for RuntimeConfigBuilder {
  fn default() -> Self {
    Self {
      loop_interval: Duration::from_secs(1),
      pending_requests_expire_after: Duration::from_secs(30),
      close_connection_if_unused_after: None,
      consider_me_dead_after: Duration::from_secs(10),
      graceful_close_timeout: Duration::from_secs(5),
      offer_expires_after: None,
    }
  }
}

impl RuntimeConfigBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn loop_interval(mut self, value: Duration) -> Self {
    self.loop_interval = value;
    self
  }

  pub fn pending_requests_expire_after(mut self, value: Duration) -> Self {
    self.pending_requests_expire_after = value;
    self
  }

  pub fn close_connection_if_unused_after(mut self, value: Duration) -> Self {
    self.close_connection_if_unused_after = Some(value);
    self
  }

  pub fn consider_me_dead_after(mut self, value: Duration) -> Self {
    self.consider_me_dead_after = value;
    self
  }

  pub fn graceful_close_timeout(mut self, value: Duration) -> Self {
    self.graceful_close_timeout = value;
    self
  }

  pub fn offer_expires_after(mut self, value: Duration) -> Self {
    self.offer_expires_after = Some(value);
    self
  }

  pub fn build(self) -> RuntimeConfig {
    RuntimeConfig {
      loop_interval: self.loop_interval,
      pending_requests_expire_after: self.pending_requests_expire_after,
      close_connection_if_unused_after: self.close_connection_if_unused_after,
      consider_me_dead_after: self.consider_me_dead_after,
      graceful_close_timeout: self.graceful_close_timeout,
      offer_expires_after: self.offer_expires_after,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_config_has_no_idle_close_or_offer_ttl() {
    let config = RuntimeConfig::default();
    assert!(config.close_connection_if_unused_after.is_none());
    assert!(config.offer_expires_after.is_none());
  }

  #[test]
  fn builder_overrides_individual_fields() {
    let config = RuntimeConfig::builder()
      .loop_interval(Duration::from_millis(250))
      .pending_requests_expire_after(Duration::from_secs(2))
      .close_connection_if_unused_after(Duration::from_secs(3))
      .offer_expires_after(Duration::from_secs(2))
      .build();

    assert_eq!(config.loop_interval, Duration::from_millis(250));
    assert_eq!(config.pending_requests_expire_after, Duration::from_secs(2));
    assert_eq!(config.close_connection_if_unused_after, Some(Duration::from_secs(3)));
    assert_eq!(config.offer_expires_after, Some(Duration::from_secs(2)));
  }
}
