//! The `StateStore` trait: durable, resumable migration progress.
//!
//! The trait is implemented by storage backends (e.g.
//! `casediff-store-sqlite`). The diff queue depends on this abstraction, not
//! on any concrete backend.

use std::{future::Future, path::Path};

use serde_json::Value;

use crate::{case::CaseRecord, diff::DocDiffs};

/// Rows fetched per page by the windowed scans.
pub const PAGE_SIZE: usize = 1000;

/// Operation counts after an upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityCounts {
  pub id:        String,
  pub total:     u32,
  pub processed: u32,
}

impl EntityCounts {
  pub fn is_complete(&self) -> bool { self.processed >= self.total }
}

/// Operation counts after an increment. `total` is `None` when the entity
/// has never been loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedCounts {
  pub id:        String,
  pub total:     Option<u32>,
  pub processed: u32,
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over the resumable state store backend.
///
/// All methods return `Send` futures so the store can be shared by worker
/// tasks on a multi-threaded runtime.
pub trait StateStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Operation counts ──────────────────────────────────────────────────

  /// Upsert case records. The stored total is the maximum of the known and
  /// the new total; processed counts are added.
  fn update_entities(
    &self,
    records: Vec<CaseRecord>,
  ) -> impl Future<Output = Result<Vec<EntityCounts>, Self::Error>> + Send + '_;

  /// Add processed-operation deltas to known entities. Unknown entities are
  /// not inserted; they come back with `total == None`.
  fn add_processed_operations(
    &self,
    deltas: Vec<(String, u32)>,
  ) -> impl Future<Output = Result<Vec<ProcessedCounts>, Self::Error>> + Send + '_;

  /// The known total operation count of one entity.
  fn total_operations(
    &self,
    id: String,
  ) -> impl Future<Output = Result<Option<u32>, Self::Error>> + Send + '_;

  /// One page of `(id, total)` for entities with `processed < total`,
  /// ordered by id and starting after `after`.
  fn unprocessed_entities_page(
    &self,
    after: Option<String>,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<(String, u32)>, Self::Error>> + Send + '_;

  // ── Durable diff queue ────────────────────────────────────────────────

  fn add_to_diff_queue(
    &self,
    ids: Vec<String>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// One page of undiffed ids, ordered, starting after `after`.
  fn undiffed_ids_page(
    &self,
    after: Option<String>,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<String>, Self::Error>> + Send + '_;

  fn count_undiffed(&self) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  // ── Diff results ──────────────────────────────────────────────────────

  /// Replace the diffs and changes of every document in `results`, drop
  /// their ids from the diff queue, and count them as diffed per kind.
  fn save_diff_results(
    &self,
    results: Vec<DocDiffs>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Record ids that a bulk load did not return.
  fn add_missing_docs(
    &self,
    kind: String,
    ids: Vec<String>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  // ── Key/value and resume state ────────────────────────────────────────

  fn get_value(
    &self,
    key: String,
  ) -> impl Future<Output = Result<Option<Value>, Self::Error>> + Send + '_;

  fn set_value(
    &self,
    key: String,
    value: Value,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn set_resume_state(
    &self,
    key: String,
    state: Value,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Take the saved resume state for `key`, or `default` if none was ever
  /// saved. The key is invalidated in the same transaction: popping again
  /// before the next [`StateStore::set_resume_state`] is an error.
  fn pop_resume_state(
    &self,
    key: String,
    default: Value,
  ) -> impl Future<Output = Result<Value, Self::Error>> + Send + '_;

  /// Copy the state owned by a child diff process out of the store at
  /// `path`, after verifying it holds nothing else.
  fn clone_partial_state_from<'a>(
    &'a self,
    path: &'a Path,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  // ── Windowed scans ────────────────────────────────────────────────────

  /// Iterate entities with unprocessed operations, one page at a time.
  fn iter_entities_with_unprocessed_operations(&self) -> UnprocessedEntities<'_, Self>
  where
    Self: Sized,
  {
    UnprocessedEntities { store: self, buf: PageBuffer::default() }
  }

  /// Iterate the durable diff queue, one page at a time.
  fn iter_undiffed_ids(&self) -> UndiffedIds<'_, Self>
  where
    Self: Sized,
  {
    UndiffedIds { store: self, buf: PageBuffer::default() }
  }
}

// ─── Windowed scans ──────────────────────────────────────────────────────────

struct PageBuffer<T> {
  page:  std::vec::IntoIter<T>,
  after: Option<String>,
  done:  bool,
}

impl<T> Default for PageBuffer<T> {
  fn default() -> Self { Self { page: Vec::new().into_iter(), after: None, done: false } }
}

impl<T> PageBuffer<T> {
  /// Install a freshly fetched page and return its first item.
  fn refill(&mut self, page: Vec<T>, key: impl Fn(&T) -> String) -> Option<T> {
    if page.len() < PAGE_SIZE {
      self.done = true;
    }
    self.after = page.last().map(key);
    self.page = page.into_iter();
    self.page.next()
  }
}

/// Scan over entities with `processed < total`. Never holds more than one
/// page of rows.
pub struct UnprocessedEntities<'s, S> {
  store: &'s S,
  buf:   PageBuffer<(String, u32)>,
}

impl<S: StateStore> UnprocessedEntities<'_, S> {
  pub async fn next(&mut self) -> Result<Option<(String, u32)>, S::Error> {
    if let Some(item) = self.buf.page.next() {
      return Ok(Some(item));
    }
    if self.buf.done {
      return Ok(None);
    }
    let page = self
      .store
      .unprocessed_entities_page(self.buf.after.take(), PAGE_SIZE)
      .await?;
    Ok(self.buf.refill(page, |(id, _)| id.clone()))
  }
}

/// Scan over the durable diff queue.
pub struct UndiffedIds<'s, S> {
  store: &'s S,
  buf:   PageBuffer<String>,
}

impl<S: StateStore> UndiffedIds<'_, S> {
  pub async fn next(&mut self) -> Result<Option<String>, S::Error> {
    if let Some(item) = self.buf.page.next() {
      return Ok(Some(item));
    }
    if self.buf.done {
      return Ok(None);
    }
    let page = self.store.undiffed_ids_page(self.buf.after.take(), PAGE_SIZE).await?;
    Ok(self.buf.refill(page, String::clone))
  }

  /// Drain the scan into a vector.
  pub async fn collect(mut self) -> Result<Vec<String>, S::Error> {
    let mut ids = Vec::new();
    while let Some(id) = self.next().await? {
      ids.push(id);
    }
    Ok(ids)
  }
}
