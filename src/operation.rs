//! Operation declarations shared by the Plugin role (§4.3) and the
//! sink machinery consumed by the Core role (§4.2).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{policy::Policy, schema::SchemaSpec};

/// A plugin-side operation handler. Replaces the Python decorator
/// (`@operation(...)`) per §9's guidance to use an explicit
/// registration API instead of decorator-driven registration.
///
/// Returns the output payload to publish on the connection's output
/// topic, or `None` if this invocation produced nothing to emit (valid
/// even for operations that declare a non-empty output schema — not
/// every input need yield a result).
#[async_trait]
pub trait OperationHandler: Send + Sync {
  async fn handle(&self, payload: Option<Bytes>) -> Option<Bytes>;
}

/// A core-side sink: invoked with every output event a connection
/// receives for its operation. The override sink from a core's
/// `OperationRequirement` takes precedence over the operation's default
/// sink (§4.2, Open Question #3: "override wins", strict replacement).
#[async_trait]
pub trait OutputSink: Send + Sync {
  async fn on_output(&self, remote_id: &str, operation_name: &str, payload: Bytes);
}

pub type Sink = Arc<dyn OutputSink>;

/// A named capability advertised by a plugin (§3). Uniquely identified
/// by `name` within a plugin.
#[derive(Clone)]
pub struct Operation {
  pub name: String,
  pub input: SchemaSpec,
  pub output: SchemaSpec,
  pub handler: Arc<dyn OperationHandler>,
  pub policy: Policy,
}

impl Operation {
  pub fn new(
    name: impl Into<String>,
    input: SchemaSpec,
    output: SchemaSpec,
    handler: Arc<dyn OperationHandler>,
    policy: Policy,
  ) -> Self {
    Self {
      name: name.into(),
      input,
      output,
      handler,
      policy,
    }
  }

  pub fn has_output(&self) -> bool {
    !matches!(self.output, SchemaSpec::Empty)
  }
}
