//! Structural diffs between two JSON documents.
//!
//! [`json_diff`] walks an old and a new representation of the same entity
//! and reports every path at which they disagree. It knows nothing about
//! which disagreements are expected; that is the job of the
//! [`rule`](crate::rule) engine.

use std::{collections::BTreeSet, fmt};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

// ─── Diff type ───────────────────────────────────────────────────────────────

/// The kind of discrepancy found at a path.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
  strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DiffType {
  /// The two sides hold values of different JSON types.
  Type,
  /// Same type, different value.
  Diff,
  /// One side has no value at this path.
  Missing,
  /// Two lists hold different sets of elements.
  SetMismatch,
  /// A composite discrepancy spanning more than one path (e.g. a renamed
  /// field whose value also changed).
  Complex,
}

// ─── Path ────────────────────────────────────────────────────────────────────

/// One step into a JSON document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathElem {
  Index(usize),
  Key(String),
}

impl From<&str> for PathElem {
  fn from(key: &str) -> Self { Self::Key(key.to_owned()) }
}

impl From<usize> for PathElem {
  fn from(index: usize) -> Self { Self::Index(index) }
}

impl fmt::Display for PathElem {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Index(i) => write!(f, "[{i}]"),
      Self::Key(k) => f.write_str(k),
    }
  }
}

pub type Path = Vec<PathElem>;

/// Build a path from string keys, e.g. `path(["form", "meta"])`.
pub fn path<'a>(keys: impl IntoIterator<Item = &'a str>) -> Path {
  keys.into_iter().map(PathElem::from).collect()
}

/// Render a path as `a.b[0].c`.
pub fn format_path(path: &[PathElem]) -> String {
  let mut out = String::new();
  for elem in path {
    match elem {
      PathElem::Key(k) => {
        if !out.is_empty() {
          out.push('.');
        }
        out.push_str(k);
      }
      PathElem::Index(_) => out.push_str(&elem.to_string()),
    }
  }
  out
}

/// Look up the value at `path` inside `doc`.
pub fn value_at<'a>(doc: &'a Value, path: &[PathElem]) -> Option<&'a Value> {
  path.iter().try_fold(doc, |node, elem| match (node, elem) {
    (Value::Object(map), PathElem::Key(k)) => map.get(k),
    (Value::Array(items), PathElem::Index(i)) => items.get(*i),
    _ => None,
  })
}

// ─── Diff ────────────────────────────────────────────────────────────────────

/// A single discrepancy between an old and a new document.
///
/// `None` for `old_value` / `new_value` means the value is absent on that
/// side, which is distinct from an explicit JSON `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diff {
  pub diff_type: DiffType,
  pub path:      Path,
  #[serde(default, skip_serializing_if = "Option::is_none", with = "present")]
  pub old_value: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none", with = "present")]
  pub new_value: Option<Value>,
}

impl Diff {
  pub fn new(
    diff_type: DiffType,
    path: Path,
    old_value: Option<Value>,
    new_value: Option<Value>,
  ) -> Self {
    Self { diff_type, path, old_value, new_value }
  }

  /// The key used to de-duplicate diffs within one filtering pass.
  pub fn identity(&self) -> (DiffType, &[PathElem]) {
    (self.diff_type, &self.path)
  }
}

impl fmt::Display for Diff {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} {}: {} -> {}",
      self.diff_type,
      format_path(&self.path),
      display_value(self.old_value.as_ref()),
      display_value(self.new_value.as_ref()),
    )
  }
}

/// Render a possibly-absent value; absence prints as `MISSING`.
pub fn display_value(value: Option<&Value>) -> String {
  match value {
    Some(v) => v.to_string(),
    None => "MISSING".to_owned(),
  }
}

/// An explained diff: a known, intentional transformation rather than a
/// migration defect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
  #[serde(flatten)]
  pub diff:   Diff,
  pub reason: String,
}

/// Diffs and changes of one document, addressed by `(kind, doc_id)`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DocDiffs {
  pub kind:    String,
  pub doc_id:  String,
  pub diffs:   Vec<Diff>,
  pub changes: Vec<Change>,
}

/// Keeps explicit JSON `null` distinct from an absent value.
mod present {
  use super::*;

  pub fn serialize<S: Serializer>(value: &Option<Value>, s: S) -> Result<S::Ok, S::Error> {
    match value {
      Some(v) => v.serialize(s),
      None => s.serialize_none(),
    }
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(d).map(Some)
  }
}

// ─── Differ ──────────────────────────────────────────────────────────────────

/// Compute every structural difference between `old` and `new`.
///
/// Maps are compared over the union of their keys, arrays index by index up
/// to the longer length. Identical documents always produce an empty list.
pub fn json_diff(old: &Value, new: &Value) -> Vec<Diff> {
  let mut diffs = Vec::new();
  let mut path = Vec::new();
  walk(Some(old), Some(new), &mut path, &mut diffs);
  diffs
}

fn walk(
  old: Option<&Value>,
  new: Option<&Value>,
  path: &mut Path,
  diffs: &mut Vec<Diff>,
) {
  match (old, new) {
    (None, None) => {}
    (None, Some(_)) | (Some(_), None) => diffs.push(Diff::new(
      DiffType::Missing,
      path.clone(),
      old.cloned(),
      new.cloned(),
    )),
    (Some(Value::Object(a)), Some(Value::Object(b))) => {
      let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
      for key in keys {
        path.push(PathElem::Key(key.clone()));
        walk(a.get(key), b.get(key), path, diffs);
        path.pop();
      }
    }
    (Some(Value::Array(a)), Some(Value::Array(b))) => {
      for i in 0..a.len().max(b.len()) {
        path.push(PathElem::Index(i));
        walk(a.get(i), b.get(i), path, diffs);
        path.pop();
      }
    }
    (Some(a), Some(b)) => {
      let diff_type = if json_type(a) != json_type(b) {
        DiffType::Type
      } else if a != b {
        DiffType::Diff
      } else {
        return;
      };
      diffs.push(Diff::new(diff_type, path.clone(), Some(a.clone()), Some(b.clone())));
    }
  }
}

fn json_type(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "bool",
    Value::Number(n) if n.is_f64() => "float",
    Value::Number(_) => "int",
    Value::String(_) => "string",
    Value::Array(_) => "array",
    Value::Object(_) => "object",
  }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
