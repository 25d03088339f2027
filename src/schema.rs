//! [MODULE D] Schema spec algebra (§3, §4.4).
//!
//! Grounded in `orbitalis/orbiter/schemaspec.py`'s `SchemaSpec.is_compatible`:
//! structural JSON comparison of fingerprints when both sides parse,
//! otherwise byte equality.

use serde::{Deserialize, Serialize};

/// An opaque schema fingerprint. Real fingerprinting (Avro-like) is out
/// of scope (§1); we only specify the comparison contract (§6.2 assumes
/// the transport hands us these as strings).
pub type SchemaFingerprint = String;

/// A three-state descriptor of the payload shapes a participant accepts
/// or offers (§3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaSpec {
  /// Any schema accepted. Used only when the participant is
  /// deliberately permissive.
  Undefined,
  /// No payload expected; matches only empty events.
  Empty,
  /// A non-empty ordered list of schema fingerprints.
  Explicit(Vec<SchemaFingerprint>),
}

impl SchemaSpec {
  pub fn from_schema(fingerprint: impl Into<SchemaFingerprint>) -> Self {
    SchemaSpec::Explicit(vec![fingerprint.into()])
  }

  pub fn from_schemas(fingerprints: impl IntoIterator<Item = SchemaFingerprint>) -> Self {
    SchemaSpec::Explicit(fingerprints.into_iter().collect())
  }

  pub fn is_undefined(&self) -> bool {
    matches!(self, SchemaSpec::Undefined)
  }

  pub fn is_empty_spec(&self) -> bool {
    matches!(self, SchemaSpec::Empty)
  }

  pub fn is_explicit(&self) -> bool {
    matches!(self, SchemaSpec::Explicit(_))
  }

  pub fn supports_empty(&self) -> bool {
    self.is_empty_spec()
  }

  fn explicit_schemas(&self) -> &[SchemaFingerprint] {
    match self {
      SchemaSpec::Explicit(schemas) => schemas,
      _ => &[],
    }
  }

  /// Compatibility per §3: both Undefined, or both Empty, or both
  /// Explicit with a non-empty fingerprint intersection. `strict`
  /// additionally requires set equality. `undefined_is_compatible`
  /// relaxes a mismatched Undefined/non-Undefined pair to compatible,
  /// used by callers that are willing to accept "any schema" on one
  /// side (e.g. a permissive plugin evaluating a concrete core need).
  pub fn is_compatible(&self, other: &SchemaSpec, undefined_is_compatible: bool, strict: bool) -> bool {
    if self.is_undefined() && other.is_undefined() {
      return true;
    }

    if self.is_undefined() != other.is_undefined() {
      return undefined_is_compatible;
    }

    if self.is_empty_spec() && other.is_empty_spec() {
      return true;
    }

    if self.is_empty_spec() != other.is_empty_spec() {
      return false;
    }

    let ours = self.explicit_schemas();
    let theirs = other.explicit_schemas();

    if ours.is_empty() != theirs.is_empty() {
      return false;
    }

    let intersects = ours
      .iter()
      .any(|mine| theirs.iter().any(|t| fingerprints_equal(mine, t)));

    if !intersects {
      return false;
    }

    if strict {
      let ours_subset_theirs = ours.iter().all(|mine| theirs.iter().any(|t| fingerprints_equal(mine, t)));
      let theirs_subset_ours = theirs.iter().all(|t| ours.iter().any(|mine| fingerprints_equal(mine, t)));
      return ours_subset_theirs && theirs_subset_ours;
    }

    true
  }

  /// Compatibility against a single concrete schema fingerprint (§4.4).
  pub fn is_compatible_with_schema(&self, fingerprint: &str, undefined_is_compatible: bool) -> bool {
    match self {
      SchemaSpec::Undefined => undefined_is_compatible,
      SchemaSpec::Empty => false,
      SchemaSpec::Explicit(schemas) => schemas.iter().any(|s| fingerprints_equal(s, fingerprint)),
    }
  }
}

/// Structural-equal over parsed schema JSON if both sides parse;
/// otherwise byte-equal.
fn fingerprints_equal(a: &str, b: &str) -> bool {
  match (
    serde_json::from_str::<serde_json::Value>(a),
    serde_json::from_str::<serde_json::Value>(b),
  ) {
    (Ok(av), Ok(bv)) => av == bv,
    _ => a == b,
  }
}
