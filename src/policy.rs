//! [MODULE E] Constraint / Policy (§3, §4.5).
//!
//! Grounded in `orbitalis/utils/policy.py` and `utils/allowblocklist.py`:
//! allow/block are mutually exclusive and enforced at construction;
//! violations are programmer errors (§7).

use std::collections::HashSet;

use crate::{
  error::{ConstraintError, PolicyError},
  id::OrbiterId,
  schema::SchemaSpec,
};

/// Shared allow/block bookkeeping used by both `Policy` (plugin-side)
/// and `Constraint` (core-side). `allowlist` and `blocklist` are
/// mutually exclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowBlockList {
  allowlist: Option<HashSet<OrbiterId>>,
  blocklist: Option<HashSet<OrbiterId>>,
}

impl AllowBlockList {
  pub fn new(
    allowlist: Option<HashSet<OrbiterId>>,
    blocklist: Option<HashSet<OrbiterId>>,
  ) -> Result<Self, PolicyError> {
    if allowlist.is_some() && blocklist.is_some() {
      return Err(PolicyError::AllowAndBlockList);
    }
    Ok(Self { allowlist, blocklist })
  }

  pub fn allow_only(id: impl Into<OrbiterId>) -> Self {
    Self {
      allowlist: Some(HashSet::from([id.into()])),
      blocklist: None,
    }
  }

  pub fn unrestricted() -> Self {
    Self::default()
  }

  /// `id ∉ blocklist ∧ (allowlist = ∅ ∨ id ∈ allowlist)` (§4.5).
  pub fn is_compatible(&self, id: &str) -> bool {
    if let Some(blocklist) = &self.blocklist {
      if blocklist.contains(id) {
        return false;
      }
    }
    if let Some(allowlist) = &self.allowlist {
      if !allowlist.contains(id) {
        return false;
      }
    }
    true
  }
}

/// Plugin-side per-operation gating (§3).
#[derive(Debug, Clone, Default)]
pub struct Policy {
  pub allow_block: AllowBlockList,
  /// Caps concurrent connections for this operation across all cores.
  pub maximum: Option<usize>,
}

impl Policy {
  pub fn new(allow_block: AllowBlockList, maximum: Option<usize>) -> Self {
    Self { allow_block, maximum }
  }

  pub fn is_compatible(&self, id: &str) -> bool {
    self.allow_block.is_compatible(id)
  }

  /// Whether the plugin still has room for `id` given the current
  /// pending+established count for this operation (I4).
  pub fn has_room(&self, current_count: usize) -> bool {
    self.maximum.map_or(true, |max| current_count < max)
  }
}

/// Core-side per-operation gating (§3). Immutable except when derived
/// in-flight as a residual `Need` (§4.2).
#[derive(Debug, Clone)]
pub struct Constraint {
  pub minimum: usize,
  pub maximum: Option<usize>,
  pub mandatory: Vec<OrbiterId>,
  pub inputs: Vec<SchemaSpec>,
  pub outputs: Vec<SchemaSpec>,
  pub allow_block: AllowBlockList,
}

impl Constraint {
  pub fn new(
    minimum: usize,
    maximum: Option<usize>,
    mandatory: Vec<OrbiterId>,
    inputs: Vec<SchemaSpec>,
    outputs: Vec<SchemaSpec>,
    allow_block: AllowBlockList,
  ) -> Result<Self, ConstraintError> {
    if let Some(maximum) = maximum {
      if minimum > maximum {
        return Err(ConstraintError::MinimumExceedsMaximum { minimum, maximum });
      }
      if mandatory.len() > maximum {
        return Err(ConstraintError::MandatoryExceedsMaximum {
          mandatory: mandatory.len(),
          maximum,
        });
      }
    }
    if inputs.is_empty() {
      return Err(ConstraintError::EmptyInputs);
    }
    if outputs.is_empty() {
      return Err(ConstraintError::EmptyOutputs);
    }
    Ok(Self {
      minimum,
      maximum,
      mandatory,
      inputs,
      outputs,
      allow_block,
    })
  }

  /// A plugin's operation is constraint-compatible iff its identifier
  /// passes allow/block, its input-schema is compatible with *some*
  /// listed input-spec, and its output-schema with *some* listed
  /// output-spec (§3).
  pub fn is_constraint_compatible(&self, remote_id: &str, input: &SchemaSpec, output: &SchemaSpec) -> bool {
    self.allow_block.is_compatible(remote_id)
      && self.inputs.iter().any(|spec| spec.is_compatible(input, false, false))
      && self.outputs.iter().any(|spec| spec.is_compatible(output, false, false))
  }

  /// Subtract established connections to produce the residual Need
  /// broadcast in discover (§4.2).
  pub fn residual(&self, connected_count: usize, connected_mandatory: &HashSet<OrbiterId>) -> Need {
    let minimum = self.minimum.saturating_sub(connected_count);
    let maximum = self.maximum.map(|m| m.saturating_sub(connected_count));
    let mandatory: Vec<OrbiterId> = self
      .mandatory
      .iter()
      .filter(|id| !connected_mandatory.contains(*id))
      .cloned()
      .collect();
    Need {
      minimum,
      maximum,
      mandatory,
      inputs: self.inputs.clone(),
      outputs: self.outputs.clone(),
      allow_block: self.allow_block.clone(),
    }
  }
}

/// The residual of a Constraint after subtracting established
/// connections (§4.2): what the core still needs, broadcast in discover.
#[derive(Debug, Clone)]
pub struct Need {
  pub minimum: usize,
  pub maximum: Option<usize>,
  pub mandatory: Vec<OrbiterId>,
  pub inputs: Vec<SchemaSpec>,
  pub outputs: Vec<SchemaSpec>,
  pub allow_block: AllowBlockList,
}

impl Need {
  /// An operation is worth discovering iff `minimum' > 0 ∨ |mandatory'| >
  /// 0 ∨ (maximum' is None ∨ maximum' > 0)` (§4.2).
  pub fn worth_discovering(&self) -> bool {
    self.minimum > 0 || !self.mandatory.is_empty() || self.maximum.map_or(true, |m| m > 0)
  }

  pub fn is_constraint_compatible(&self, remote_id: &str, input: &SchemaSpec, output: &SchemaSpec) -> bool {
    self.allow_block.is_compatible(remote_id)
      && self.inputs.iter().any(|spec| spec.is_compatible(input, false, false))
      && self.outputs.iter().any(|spec| spec.is_compatible(output, false, false))
  }
}

/// A core-side requirement for one operation (§3). The override sink
/// takes precedence over the default per-operation sink (§4.2, §4.3,
/// Open Question #3: override strictly replaces default).
pub struct OperationRequirement {
  pub constraint: Constraint,
  pub default_setup_data: Option<bytes::Bytes>,
  pub override_sink: Option<crate::operation::Sink>,
}

impl OperationRequirement {
  pub fn new(constraint: Constraint) -> Self {
    Self {
      constraint,
      default_setup_data: None,
      override_sink: None,
    }
  }

  pub fn with_setup_data(mut self, data: bytes::Bytes) -> Self {
    self.default_setup_data = Some(data);
    self
  }

  pub fn with_override_sink(mut self, sink: crate::operation::Sink) -> Self {
    self.override_sink = Some(sink);
    self
  }
}
