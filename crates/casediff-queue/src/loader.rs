//! [`DocumentLoader`] implementations: JSON files on disk, and an in-memory
//! map that records every call.

use std::{
  collections::HashMap,
  io,
  path::{Path, PathBuf},
  sync::{
    Mutex,
    atomic::{AtomicUsize, Ordering},
  },
};

use casediff_core::{case::Document, loader::DocumentLoader};
use serde_json::Value;

use crate::{Error, Result, lock};

// ─── JSON directory ──────────────────────────────────────────────────────────

/// Loads `<dir>/<id>.json`. Files that do not exist are missing documents.
#[derive(Debug, Clone)]
pub struct JsonDirLoader {
  dir: PathBuf,
}

impl JsonDirLoader {
  pub fn new(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into() } }

  pub fn dir(&self) -> &Path { &self.dir }

  async fn load_one(&self, id: &str) -> Result<Option<Document>> {
    if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
      tracing::warn!(id, "refusing to load document with unsafe id");
      return Ok(None);
    }
    let path = self.dir.join(format!("{id}.json"));
    let bytes = match tokio::fs::read(&path).await {
      Ok(bytes) => bytes,
      Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(err) => return Err(err.into()),
    };
    let json: Value = serde_json::from_slice(&bytes)?;
    Ok(Some(Document::new(id, json)))
  }
}

impl DocumentLoader for JsonDirLoader {
  type Error = Error;

  async fn load<'a>(&'a self, ids: &'a [String]) -> Result<Vec<Document>> {
    let mut docs = Vec::with_capacity(ids.len());
    for id in ids {
      if let Some(doc) = self.load_one(id).await? {
        docs.push(doc);
      }
    }
    Ok(docs)
  }
}

// ─── In memory ───────────────────────────────────────────────────────────────

/// A loader over an in-memory map. Every call is recorded, and failures can
/// be injected for the next `n` calls.
#[derive(Debug, Default)]
pub struct MemoryLoader {
  docs:     Mutex<HashMap<String, Value>>,
  calls:    Mutex<Vec<Vec<String>>>,
  failures: AtomicUsize,
}

impl MemoryLoader {
  pub fn new() -> Self { Self::default() }

  pub fn with(self, id: &str, json: Value) -> Self {
    self.insert(id, json);
    self
  }

  pub fn insert(&self, id: &str, json: Value) { lock(&self.docs).insert(id.to_owned(), json); }

  pub fn remove(&self, id: &str) -> Option<Value> { lock(&self.docs).remove(id) }

  /// Make the next `n` calls fail.
  pub fn fail_next(&self, n: usize) { self.failures.store(n, Ordering::SeqCst); }

  /// The ids requested by each call so far.
  pub fn calls(&self) -> Vec<Vec<String>> { lock(&self.calls).clone() }
}

impl DocumentLoader for MemoryLoader {
  type Error = Error;

  async fn load<'a>(&'a self, ids: &'a [String]) -> Result<Vec<Document>> {
    lock(&self.calls).push(ids.to_vec());
    let failing = self
      .failures
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok();
    if failing {
      return Err(Error::loader(io::Error::other("injected load failure")));
    }
    let docs = lock(&self.docs);
    Ok(
      ids
        .iter()
        .filter_map(|id| docs.get(id).map(|json| Document::new(id.as_str(), json.clone())))
        .collect(),
    )
  }
}
