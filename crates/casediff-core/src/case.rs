//! Case documents and their operation bookkeeping.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::builtin::CASE_KIND;

/// Cases touched by more operations than this are not kept in memory
/// between load and diff.
pub const MAX_OPERATIONS_PER_MEMORIZED_ENTITY: u32 = 20;

/// A full document as returned by a bulk loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
  pub id:   String,
  pub json: Value,
}

impl Document {
  pub fn new(id: impl Into<String>, json: Value) -> Self {
    Self { id: id.into(), json }
  }

  /// The document kind, read from `doc_type`.
  pub fn kind(&self) -> &str {
    self.json.get("doc_type").and_then(Value::as_str).unwrap_or(CASE_KIND)
  }

  /// Ids of every operation that touched this document: the `xform_ids`
  /// list plus the `xform_id` of each entry in `actions`.
  pub fn operation_ids(&self) -> BTreeSet<&str> {
    let listed = self
      .json
      .get("xform_ids")
      .and_then(Value::as_array)
      .into_iter()
      .flatten()
      .filter_map(Value::as_str);
    let from_actions = self
      .json
      .get("actions")
      .and_then(Value::as_array)
      .into_iter()
      .flatten()
      .filter_map(|action| action.get("xform_id").and_then(Value::as_str))
      .filter(|id| !id.is_empty());
    listed.chain(from_actions).collect()
  }

  pub fn to_json(&self) -> &Value { &self.json }
}

/// Operation counts for one case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseRecord {
  pub id:                   String,
  pub total_operations:     u32,
  pub processed_operations: u32,
}

impl CaseRecord {
  pub fn from_document(doc: &Document, processed_operations: u32) -> Self {
    Self {
      id: doc.id.clone(),
      total_operations: doc.operation_ids().len() as u32,
      processed_operations,
    }
  }

  /// Whether the document is small enough to keep cached until it is diffed.
  pub fn should_memorize(&self) -> bool {
    self.total_operations <= MAX_OPERATIONS_PER_MEMORIZED_ENTITY
  }

  pub fn is_complete(&self) -> bool { self.processed_operations >= self.total_operations }
}

impl std::fmt::Display for CaseRecord {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "case {} with {} of {} forms processed",
      self.id, self.processed_operations, self.total_operations
    )
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn operations_are_deduplicated_across_sources() {
    let doc = Document::new(
      "c1",
      json!({
        "xform_ids": ["f1", "f2"],
        "actions": [{"xform_id": "f2"}, {"xform_id": "f3"}, {"xform_id": ""}, {}],
      }),
    );
    assert_eq!(doc.operation_ids().into_iter().collect::<Vec<_>>(), ["f1", "f2", "f3"]);
    let rec = CaseRecord::from_document(&doc, 1);
    assert_eq!(rec.total_operations, 3);
    assert!(!rec.is_complete());
    assert!(rec.should_memorize());
  }

  #[test]
  fn kind_defaults_to_case() {
    assert_eq!(Document::new("c", json!({})).kind(), CASE_KIND);
    let deleted = Document::new("c", json!({"doc_type": "CommCareCase-Deleted"}));
    assert_eq!(deleted.kind(), "CommCareCase-Deleted");
  }
}
