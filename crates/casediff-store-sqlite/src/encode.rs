//! Encoding and decoding helpers between domain types and the text columns
//! stored in SQLite.
//!
//! Diff and change sets are stored as compact JSON arrays, key/value entries
//! as JSON text. Timestamps are RFC 3339 strings.

use casediff_core::diff::{Change, Diff, DocDiffs};
use chrono::Utc;
use serde_json::Value;

use crate::{Error, Result};

/// Stored in place of a popped resume state until the next save. It is not
/// valid JSON, so it can never collide with a saved state.
pub const RESUME_NOT_ALLOWED: &str = "RESUME NOT ALLOWED";

pub fn resume_key(key: &str) -> String { format!("resume-{key}") }

pub fn now() -> String { Utc::now().to_rfc3339() }

// ─── Counts ──────────────────────────────────────────────────────────────────

pub fn encode_count(n: u32) -> i64 { i64::from(n) }

pub fn decode_count(n: i64) -> Result<u32> {
  u32::try_from(n).map_err(|_| Error::Corrupt(format!("operation count out of range: {n}")))
}

// ─── JSON ────────────────────────────────────────────────────────────────────

pub fn encode_value(value: &Value) -> Result<String> { Ok(serde_json::to_string(value)?) }

pub fn decode_value(s: &str) -> Result<Value> { Ok(serde_json::from_str(s)?) }

pub fn encode_diffs(diffs: &[Diff]) -> Result<String> { Ok(serde_json::to_string(diffs)?) }

pub fn decode_diffs(s: &str) -> Result<Vec<Diff>> { Ok(serde_json::from_str(s)?) }

pub fn encode_changes(changes: &[Change]) -> Result<String> {
  Ok(serde_json::to_string(changes)?)
}

pub fn decode_changes(s: &str) -> Result<Vec<Change>> { Ok(serde_json::from_str(s)?) }

// ─── Row types ───────────────────────────────────────────────────────────────

/// A diff result encoded for insertion. Empty sets are `None` so that the
/// row is deleted rather than rewritten.
pub struct EncodedResult {
  pub kind:    String,
  pub doc_id:  String,
  pub diffs:   Option<String>,
  pub changes: Option<String>,
}

impl EncodedResult {
  pub fn encode(result: &DocDiffs) -> Result<Self> {
    Ok(Self {
      kind:    result.kind.clone(),
      doc_id:  result.doc_id.clone(),
      diffs:   (!result.diffs.is_empty()).then(|| encode_diffs(&result.diffs)).transpose()?,
      changes: (!result.changes.is_empty())
        .then(|| encode_changes(&result.changes))
        .transpose()?,
    })
  }
}

/// Raw strings read from a `diffs` or `changes` row.
pub struct RawDocRow {
  pub kind:    String,
  pub doc_id:  String,
  pub payload: String,
}

impl RawDocRow {
  pub fn into_diffs(self) -> Result<DocDiffs> {
    Ok(DocDiffs {
      diffs: decode_diffs(&self.payload)?,
      kind: self.kind,
      doc_id: self.doc_id,
      changes: vec![],
    })
  }

  pub fn into_changes(self) -> Result<DocDiffs> {
    Ok(DocDiffs {
      changes: decode_changes(&self.payload)?,
      kind: self.kind,
      doc_id: self.doc_id,
      diffs: vec![],
    })
  }
}
