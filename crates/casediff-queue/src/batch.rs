//! Task groups and batches that are retained until processed.

use std::{
  collections::BTreeMap,
  future::Future,
  sync::{
    Arc, Mutex,
    atomic::{AtomicU64, AtomicUsize, Ordering},
  },
  time::Duration,
};

use tokio::task::{AbortHandle, JoinSet};

use crate::{Error, Result, lock};

/// Attempts made per batch before it is given up.
pub const MAX_RETRIES: u32 = 3;

const JOIN_POLL: Duration = Duration::from_secs(10);

// ─── TaskGroup ───────────────────────────────────────────────────────────────

/// Decrements the running count when a task finishes or is aborted.
struct Running(Arc<AtomicUsize>);

impl Drop for Running {
  fn drop(&mut self) { self.0.fetch_sub(1, Ordering::Relaxed); }
}

/// A set of tasks that is joined as a whole.
///
/// Tasks spawned while a join is in progress are waited for by the same
/// join.
#[derive(Default)]
pub struct TaskGroup {
  tasks:   Mutex<JoinSet<Result<()>>>,
  running: Arc<AtomicUsize>,
}

impl TaskGroup {
  pub fn new() -> Self { Self::default() }

  pub fn spawn<F>(&self, task: F) -> AbortHandle
  where
    F: Future<Output = Result<()>> + Send + 'static,
  {
    self.running.fetch_add(1, Ordering::Relaxed);
    let running = Running(Arc::clone(&self.running));
    lock(&self.tasks).spawn(async move {
      let _running = running;
      task.await
    })
  }

  /// Number of tasks not yet finished.
  pub fn len(&self) -> usize { self.running.load(Ordering::Relaxed) }

  pub fn is_empty(&self) -> bool { self.len() == 0 }

  /// Wait until no task is left, returning the errors of failed tasks.
  pub async fn join(&self) -> Vec<Error> {
    let mut errors = vec![];
    loop {
      let mut set = std::mem::take(&mut *lock(&self.tasks));
      if set.is_empty() {
        return errors;
      }
      loop {
        match tokio::time::timeout(JOIN_POLL, set.join_next()).await {
          Ok(None) => break,
          Ok(Some(Ok(Ok(())))) => {}
          Ok(Some(Ok(Err(err)))) => errors.push(err),
          Ok(Some(Err(err))) => {
            tracing::error!(error = %err, "case diff worker failed");
            errors.push(err.into());
          }
          Err(_) => tracing::info!("Waiting on {} case diff workers", self.len()),
        }
      }
    }
  }

  /// Abort every task and wait for them to stop.
  pub async fn shutdown(&self) {
    loop {
      let mut set = std::mem::take(&mut *lock(&self.tasks));
      if set.is_empty() {
        return;
      }
      set.shutdown().await;
    }
  }
}

// ─── BatchProcessor ──────────────────────────────────────────────────────────

/// Processes batches on a [`TaskGroup`].
///
/// Each batch is retained under a monotonic key until its job succeeds, so
/// batches that could not be processed can be listed and saved for a later
/// run.
pub struct BatchProcessor<T> {
  group:    Arc<TaskGroup>,
  next_key: AtomicU64,
  batches:  Arc<Mutex<BTreeMap<u64, T>>>,
}

impl<T: Clone + Send + 'static> BatchProcessor<T> {
  pub fn new(group: Arc<TaskGroup>) -> Self {
    Self {
      group,
      next_key: AtomicU64::new(0),
      batches: Arc::new(Mutex::new(BTreeMap::new())),
    }
  }

  /// Retain `batch` and spawn a job that runs `process` on it, retrying up
  /// to [`MAX_RETRIES`] attempts. After the last failed attempt the error
  /// is logged and becomes the job's result; the batch stays retained.
  pub fn spawn<F, Fut>(&self, batch: T, process: F) -> AbortHandle
  where
    F: Fn(T) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
  {
    let key = self.next_key.fetch_add(1, Ordering::Relaxed);
    lock(&self.batches).insert(key, batch);
    let batches = Arc::clone(&self.batches);
    tracing::debug!(key, "schedule batch");

    self.group.spawn(async move {
      let mut attempts = 0;
      loop {
        attempts += 1;
        let Some(batch) = lock(&batches).get(&key).cloned() else {
          return Ok(());
        };
        match process(batch).await {
          Ok(()) => {
            lock(&batches).remove(&key);
            return Ok(());
          }
          Err(err) if attempts < MAX_RETRIES => {
            tracing::warn!(key, attempts, error = %err, "retrying batch on error");
          }
          Err(err) => {
            tracing::error!(key, attempts, error = %err, "batch processing error");
            return Err(Error::BatchFailed { attempts, source: Box::new(err) });
          }
        }
      }
    })
  }

  /// Number of batches not yet processed successfully.
  pub fn len(&self) -> usize { lock(&self.batches).len() }

  pub fn is_empty(&self) -> bool { lock(&self.batches).is_empty() }

  /// Retained batches in the order they were spawned.
  pub fn batches(&self) -> Vec<T> { lock(&self.batches).values().cloned().collect() }
}
