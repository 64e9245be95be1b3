//! [`CaseDiffSink`]: where the migration reports the cases each operation
//! touched.

use std::{future::Future, sync::Arc};

use casediff_core::{loader::DocumentLoader, store::StateStore};

use crate::{CaseDiffQueue, Error, Result};

/// Receives case ids as operations are migrated.
pub trait CaseDiffSink: Send + Sync {
  /// Operation `form_id` touched `case_ids`.
  fn update(
    &self,
    case_ids: Vec<String>,
    form_id: Option<String>,
  ) -> impl Future<Output = Result<()>> + Send + '_;

  /// Diff `case_id` regardless of its operation counts.
  fn enqueue(&self, case_id: String) -> impl Future<Output = Result<()>> + Send + '_;

  /// Stop the next flush from sweeping cases with unprocessed operations.
  fn clean_break(&self) {}

  /// End the run, saving whatever is needed to resume.
  fn close(self, error: bool) -> impl Future<Output = Result<()>> + Send
  where
    Self: Sized;
}

impl<S, L> CaseDiffSink for CaseDiffQueue<S, L>
where
  S: StateStore + 'static,
  L: DocumentLoader + 'static,
{
  async fn update(&self, case_ids: Vec<String>, form_id: Option<String>) -> Result<()> {
    CaseDiffQueue::update(self, &case_ids, form_id.as_deref());
    tokio::task::yield_now().await;
    Ok(())
  }

  async fn enqueue(&self, case_id: String) -> Result<()> {
    CaseDiffQueue::enqueue(self, case_id).await
  }

  fn clean_break(&self) { self.set_clean_break(); }

  async fn close(self, error: bool) -> Result<()> { CaseDiffQueue::finish(&self, error).await }
}

// ─── Pending ─────────────────────────────────────────────────────────────────

/// Records cases in the durable diff queue without diffing them. A later
/// `cases --select pending` run picks them up.
pub struct CaseDiffPending<S> {
  store: Arc<S>,
}

impl<S: StateStore> CaseDiffPending<S> {
  pub fn new(store: Arc<S>) -> Self { Self { store } }
}

impl<S: StateStore + 'static> CaseDiffSink for CaseDiffPending<S> {
  async fn update(&self, case_ids: Vec<String>, _form_id: Option<String>) -> Result<()> {
    self.store.add_to_diff_queue(case_ids).await.map_err(Error::store)
  }

  async fn enqueue(&self, case_id: String) -> Result<()> {
    self.store.add_to_diff_queue(vec![case_id]).await.map_err(Error::store)
  }

  async fn close(self, _error: bool) -> Result<()> { Ok(()) }
}
