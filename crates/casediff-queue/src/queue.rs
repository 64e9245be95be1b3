//! [`CaseDiffQueue`]: diff each case once every operation that touched it
//! has been processed.
//!
//! Cases move through these phases:
//!
//! 1. `update` counts the operations seen per case and hands full batches
//!    to a load job.
//! 2. Known cases get their processed counts bumped; complete ones are
//!    enqueued to diff. Unknown cases accumulate into load batches.
//! 3. Load jobs fetch the legacy documents, record each case's total
//!    operation count, keep small documents in an LRU cache and enqueue the
//!    complete ones.
//! 4. Enqueued cases are diffed in batches on a bounded number of workers.
//!
//! Progress lives in the state store, and whatever is still in flight when
//! the queue finishes is saved as resume state. A case may be diffed more
//! than once across a stop and resume, but none is lost.

use std::{
  collections::{BTreeMap, HashSet},
  sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
  },
  time::Duration,
};

use casediff_core::{
  builtin::CASE_KIND,
  case::{CaseRecord, Document},
  diff::{Diff, DiffType, DocDiffs, path},
  loader::DocumentLoader,
  lru::LruCache,
  rule::RuleSet,
  store::StateStore,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;

use crate::{
  Error, Result,
  batch::{BatchProcessor, TaskGroup},
  casediff::diff_documents,
  lock,
  status::{QueueStatus, StatusLogger},
};

pub const BATCH_SIZE: usize = 100;
pub const MAX_DIFF_WORKERS: usize = 10;
pub const MAX_MEMORIZED_CASES: usize = 4096;
/// Upper bound on the operations of all cases in one diff batch.
pub const MAX_FORMS_PER_DIFF: u32 = 1000;
pub const STATUS_INTERVAL: Duration = Duration::from_secs(300);

/// Set on a store used directly by a queue; such a store cannot be handed to
/// a case diff process.
pub const PROCESS_NOT_ALLOWED: &str = "ProcessNotAllowed";

const RESUME_KEY: &str = "CaseDiffQueue";

/// Case id -> processed operation count.
type Counts = BTreeMap<String, u32>;

// ─── Settings ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct QueueSettings {
  pub batch_size:          usize,
  pub max_diff_workers:    usize,
  pub max_memorized_cases: usize,
  /// Zero disables the status logger.
  pub status_interval:     Duration,
}

impl Default for QueueSettings {
  fn default() -> Self {
    Self {
      batch_size:          BATCH_SIZE,
      max_diff_workers:    MAX_DIFF_WORKERS,
      max_memorized_cases: MAX_MEMORIZED_CASES,
      status_interval:     STATUS_INTERVAL,
    }
  }
}

impl QueueSettings {
  fn validate(&self) -> Result<()> {
    if self.batch_size == 0 || self.max_diff_workers == 0 {
      return Err(Error::Settings("batch size and diff workers must be positive".into()));
    }
    if self.batch_size >= self.max_memorized_cases {
      return Err(Error::Settings(format!(
        "batch size {} must be smaller than the case cache ({})",
        self.batch_size, self.max_memorized_cases
      )));
    }
    Ok(())
  }
}

/// What a finished queue leaves behind for the next run.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ResumeState {
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pending:          Counts,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  to_diff:          Vec<String>,
  #[serde(default, skip_serializing_if = "is_zero")]
  num_diffed_cases: u64,
}

fn is_zero(n: &u64) -> bool { *n == 0 }

// ─── State ───────────────────────────────────────────────────────────────────

/// In-memory queue state. Guarded by one mutex that is never held across an
/// await.
struct QueueState {
  pending_cases: Counts,
  pending_loads: Counts,
  /// Case id -> total operations, ready to diff.
  cases_to_diff: Counts,
  cache:         LruCache<String, Document>,
  /// (hits, diffed) since the last status snapshot.
  cache_hits:    (u64, u64),
  num_diffed:    u64,
  overshoot:     u64,
  flushing:      bool,
}

struct Inner<S, L> {
  store:         Arc<S>,
  old:           L,
  new:           L,
  rules:         Arc<RuleSet>,
  settings:      QueueSettings,
  state:         Mutex<QueueState>,
  pool:          Arc<TaskGroup>,
  diff_pool:     Arc<TaskGroup>,
  diff_slots:    Semaphore,
  case_batcher:  BatchProcessor<Counts>,
  diff_batcher:  BatchProcessor<Vec<String>>,
  clean_break:   Arc<AtomicBool>,
  status_logger: Mutex<Option<StatusLogger>>,
}

// ─── Queue ───────────────────────────────────────────────────────────────────

/// Diffs cases loaded by `old` against their counterparts loaded by `new`,
/// recording progress in `S`.
///
/// Cloning is cheap and yields a handle to the same queue.
pub struct CaseDiffQueue<S, L> {
  inner: Arc<Inner<S, L>>,
}

impl<S, L> Clone for CaseDiffQueue<S, L> {
  fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<S, L> CaseDiffQueue<S, L>
where
  S: StateStore + 'static,
  L: DocumentLoader + 'static,
{
  /// Start a queue on `store`, picking up the state saved by the previous
  /// run.
  ///
  /// Fails if the previous run took its resume state without saving it
  /// back.
  pub async fn start(
    store: Arc<S>,
    old: L,
    new: L,
    rules: Arc<RuleSet>,
    settings: QueueSettings,
  ) -> Result<Self> {
    settings.validate()?;
    store
      .set_value(PROCESS_NOT_ALLOWED.into(), json!(true))
      .await
      .map_err(Error::store)?;
    let saved = store
      .pop_resume_state(RESUME_KEY.into(), json!({}))
      .await
      .map_err(Error::store)?;
    let resume: ResumeState = serde_json::from_value(saved)?;

    let pool = Arc::new(TaskGroup::new());
    let diff_pool = Arc::new(TaskGroup::new());
    let inner = Arc::new(Inner {
      state: Mutex::new(QueueState {
        pending_cases: Counts::new(),
        pending_loads: Counts::new(),
        cases_to_diff: Counts::new(),
        cache:         LruCache::new(settings.max_memorized_cases),
        cache_hits:    (0, 0),
        num_diffed:    0,
        overshoot:     0,
        flushing:      false,
      }),
      case_batcher: BatchProcessor::new(Arc::clone(&pool)),
      diff_batcher: BatchProcessor::new(Arc::clone(&diff_pool)),
      diff_slots: Semaphore::new(settings.max_diff_workers),
      clean_break: Arc::new(AtomicBool::new(false)),
      status_logger: Mutex::new(None),
      store,
      old,
      new,
      rules,
      settings,
      pool,
      diff_pool,
    });

    inner.load_resume_state(resume).await?;

    let interval = inner.settings.status_interval;
    if !interval.is_zero() {
      let weak = Arc::downgrade(&inner);
      let logger = StatusLogger::spawn(interval, move || {
        weak.upgrade().map(|inner| inner.get_status())
      });
      *lock(&inner.status_logger) = Some(logger);
    }
    Ok(Self { inner })
  }

  /// Record that operation `form_id` touched `case_ids`. Without an
  /// operation id the cases are tracked but no operation is counted.
  ///
  /// Never waits: full batches are handed to background jobs.
  pub fn update(&self, case_ids: &[String], form_id: Option<&str>) {
    tracing::debug!(cases = ?case_ids, form = ?form_id, "update");
    let increment = u32::from(form_id.is_some());
    let mut full = vec![];
    {
      let mut st = lock(&self.inner.state);
      for id in case_ids {
        *st.pending_cases.entry(id.clone()).or_default() += increment;
        if st.pending_cases.len() >= self.inner.settings.batch_size {
          full.push(std::mem::take(&mut st.pending_cases));
        }
      }
    }
    for batch in full {
      self.inner.spawn_enqueue_or_load(batch);
    }
  }

  /// Queue a case to be diffed regardless of its operation counts.
  pub async fn enqueue(&self, case_id: String) -> Result<()> {
    self.inner.enqueue(case_id, None).await
  }

  /// Drain all in-flight work. With `complete`, cases whose operations
  /// were never all processed are diffed too.
  pub async fn flush(&self, complete: bool) -> Result<()> { self.inner.flush(complete).await }

  /// Final flush at the end of a successful run. After a clean break the
  /// unprocessed-case sweep is skipped.
  pub async fn process_remaining_diffs(&self) -> Result<()> {
    tracing::debug!("process remaining diffs");
    let complete = !self.is_clean_break();
    self.inner.flush(complete).await?;
    for (lost, action) in [
      (self.inner.case_batcher.len(), "loaded"),
      (self.inner.diff_batcher.len(), "diffed"),
    ] {
      if lost > 0 {
        tracing::warn!("{lost} batches of cases could not be {action}");
      }
    }
    Ok(())
  }

  /// End the run. Remaining diffs are processed unless the run is ending
  /// with an error; the resume state is saved either way.
  pub async fn finish(&self, error: bool) -> Result<()> {
    let outcome = if error { Ok(()) } else { self.process_remaining_diffs().await };
    if error || outcome.is_err() {
      self.inner.pool.shutdown().await;
      self.inner.diff_pool.shutdown().await;
    }
    tracing::info!("preparing to save resume state... DO NOT BREAK!");
    let saved = self.inner.save_resume_state().await;
    drop(lock(&self.inner.status_logger).take());
    outcome.and(saved)
  }

  /// Snapshot progress counters. Cache hit counts restart from zero after
  /// each call.
  pub fn get_status(&self) -> QueueStatus { self.inner.get_status() }

  pub fn set_clean_break(&self) { self.inner.clean_break.store(true, Ordering::SeqCst); }

  pub fn is_clean_break(&self) -> bool { self.inner.clean_break.load(Ordering::SeqCst) }

  /// The flag behind [`CaseDiffQueue::set_clean_break`], for signal
  /// handlers.
  pub fn clean_break_flag(&self) -> Arc<AtomicBool> { Arc::clone(&self.inner.clean_break) }

  pub fn store(&self) -> &Arc<S> { &self.inner.store }
}

impl<S, L> Inner<S, L>
where
  S: StateStore + 'static,
  L: DocumentLoader + 'static,
{
  fn spawn_enqueue_or_load(self: &Arc<Self>, batch: Counts) {
    let inner = Arc::clone(self);
    self.case_batcher.spawn(batch, move |batch| {
      let inner = Arc::clone(&inner);
      async move { inner.enqueue_or_load(batch).await }
    });
  }

  fn spawn_load_cases(self: &Arc<Self>, batch: Counts) {
    let inner = Arc::clone(self);
    self.case_batcher.spawn(batch, move |batch| {
      let inner = Arc::clone(&inner);
      async move { inner.load_cases(batch).await }
    });
  }

  fn spawn_diff(self: &Arc<Self>, case_ids: Vec<String>) {
    let inner = Arc::clone(self);
    self.diff_batcher.spawn(case_ids, move |case_ids| {
      let inner = Arc::clone(&inner);
      async move { inner.diff_cases(case_ids).await }
    });
  }

  fn note_overshoot(&self, id: &str, total: u32, processed: u32) {
    if processed > total {
      tracing::debug!(case = id, total, processed, "processed more operations than the case has");
      lock(&self.state).overshoot += 1;
    }
  }

  // ── Load ──────────────────────────────────────────────────────────────

  /// Count processed operations. Complete cases are enqueued, unknown ones
  /// collected into load batches (loaded right away while flushing).
  async fn enqueue_or_load(self: &Arc<Self>, pending: Counts) -> Result<()> {
    tracing::debug!(cases = pending.len(), "enqueue or load");
    let deltas = pending.into_iter().collect();
    let counts = self
      .store
      .add_processed_operations(deltas)
      .await
      .map_err(Error::store)?;

    let mut ready = vec![];
    let mut full_loads = vec![];
    let flush_loads = {
      let mut st = lock(&self.state);
      for c in counts {
        match c.total {
          None => {
            *st.pending_loads.entry(c.id).or_default() += c.processed;
            if st.pending_loads.len() >= self.settings.batch_size {
              full_loads.push(std::mem::take(&mut st.pending_loads));
            }
          }
          Some(total) if total <= c.processed => ready.push((c.id, total, c.processed)),
          Some(_) => {
            st.cache.touch(&c.id);
          }
        }
      }
      if st.flushing && !st.pending_loads.is_empty() {
        Some(std::mem::take(&mut st.pending_loads))
      } else {
        None
      }
    };

    for batch in full_loads {
      self.spawn_load_cases(batch);
    }
    for (id, total, processed) in ready {
      self.note_overshoot(&id, total, processed);
      self.enqueue(id, Some(processed)).await?;
    }
    if let Some(batch) = flush_loads {
      self.load_cases(batch).await?;
    }
    Ok(())
  }

  /// Load legacy documents to learn their total operation counts.
  async fn load_cases(self: &Arc<Self>, pending: Counts) -> Result<()> {
    tracing::debug!(cases = pending.len(), "load cases");
    let case_ids: Vec<String> = pending.keys().cloned().collect();
    let docs = self.old.load(&case_ids).await.map_err(Error::loader)?;

    let mut loaded = HashSet::new();
    let mut records = vec![];
    {
      let mut st = lock(&self.state);
      for doc in docs {
        let Some(processed) = pending.get(&doc.id).copied() else {
          continue;
        };
        let rec = CaseRecord::from_document(&doc, processed);
        loaded.insert(doc.id.clone());
        if rec.should_memorize() {
          tracing::debug!("memorize {rec}");
          st.cache.set(doc.id.clone(), doc);
        }
        records.push(rec);
      }
    }

    if !records.is_empty() {
      let counts = self.store.update_entities(records).await.map_err(Error::store)?;
      for c in counts {
        if c.is_complete() {
          self.note_overshoot(&c.id, c.total, c.processed);
          self.enqueue(c.id, Some(c.processed)).await?;
        }
      }
    }

    let missing: Vec<String> = case_ids.into_iter().filter(|id| !loaded.contains(id)).collect();
    if !missing.is_empty() {
      tracing::error!("Found {} missing legacy cases", missing.len());
      self
        .store
        .add_missing_docs(CASE_KIND.into(), missing.clone())
        .await
        .map_err(Error::store)?;
      let results = missing
        .into_iter()
        .map(|doc_id| DocDiffs {
          kind: CASE_KIND.into(),
          doc_id,
          diffs: vec![Diff::new(DiffType::Missing, path(["*"]), None, Some(json!("?")))],
          changes: vec![],
        })
        .collect();
      self.store.save_diff_results(results).await.map_err(Error::store)?;
    }
    Ok(())
  }

  // ── Diff ──────────────────────────────────────────────────────────────

  /// Add a case to the ready list, spawning diff jobs as batches fill up.
  /// Without `num_forms` the stored total is used.
  async fn enqueue(self: &Arc<Self>, case_id: String, num_forms: Option<u32>) -> Result<()> {
    let num_forms = match num_forms {
      Some(n) => n,
      None => self
        .store
        .total_operations(case_id.clone())
        .await
        .map_err(Error::store)?
        .unwrap_or(0),
    };

    let mut batches = vec![];
    {
      let mut st = lock(&self.state);
      if !st.cases_to_diff.is_empty() {
        let queued: u64 = st.cases_to_diff.values().map(|&n| u64::from(n)).sum();
        if queued + u64::from(num_forms) > u64::from(MAX_FORMS_PER_DIFF) {
          batches.push(std::mem::take(&mut st.cases_to_diff));
        }
      }
      st.cases_to_diff.insert(case_id, num_forms);
      if st.cases_to_diff.len() >= self.settings.batch_size || num_forms > MAX_FORMS_PER_DIFF {
        batches.push(std::mem::take(&mut st.cases_to_diff));
      }
    }
    for batch in batches {
      self.spawn_diff(batch.into_keys().collect());
    }
    Ok(())
  }

  /// Diff one batch: cached documents first, the rest loaded.
  async fn diff_cases(self: &Arc<Self>, case_ids: Vec<String>) -> Result<()> {
    let _slot = self.diff_slots.acquire().await.map_err(|_| Error::ShutDown)?;

    let (mut docs, to_load, flushing) = {
      let mut st = lock(&self.state);
      let mut docs = vec![];
      let mut to_load = vec![];
      for id in case_ids {
        match st.cache.pop(&id) {
          Some(doc) => docs.push(doc),
          None => to_load.push(id),
        }
      }
      (docs, to_load, st.flushing)
    };
    let cached: HashSet<String> = docs.iter().map(|doc| doc.id.clone()).collect();
    if !to_load.is_empty() {
      docs.extend(self.old.load(&to_load).await.map_err(Error::loader)?);
    }

    let docs = if flushing {
      docs
    } else {
      let (ready, premature) = self.prune_premature_diffs(docs).await?;
      let mut st = lock(&self.state);
      for doc in premature {
        if cached.contains(&doc.id) {
          st.cache.set(doc.id.clone(), doc);
        }
      }
      ready
    };
    if docs.is_empty() {
      return Ok(());
    }

    let results = diff_documents(&self.new, &self.rules, &docs).await?;
    self.store.save_diff_results(results).await.map_err(Error::store)?;

    let hits = docs.iter().filter(|doc| cached.contains(&doc.id)).count() as u64;
    let mut st = lock(&self.state);
    st.cache_hits.0 += hits;
    st.cache_hits.1 += docs.len() as u64;
    st.num_diffed += docs.len() as u64;
    Ok(())
  }

  /// Split `docs` into cases that are complete and cases that turn out to
  /// still have unprocessed operations.
  async fn prune_premature_diffs(
    &self,
    docs: Vec<Document>,
  ) -> Result<(Vec<Document>, Vec<Document>)> {
    let records = docs.iter().map(|doc| CaseRecord::from_document(doc, 0)).collect();
    let counts = self.store.update_entities(records).await.map_err(Error::store)?;

    let mut complete = HashSet::new();
    let mut n_forms = 0_u64;
    for c in counts {
      if c.is_complete() {
        n_forms += u64::from(c.total);
        complete.insert(c.id);
      } else {
        tracing::debug!(
          "pruned premature diff: {} ({} total > {} processed)",
          c.id,
          c.total,
          c.processed
        );
      }
    }
    if n_forms > u64::from(MAX_FORMS_PER_DIFF) * 5 {
      tracing::warn!("diff {} cases with {n_forms} forms", complete.len());
    }
    Ok(docs.into_iter().partition(|doc| complete.contains(&doc.id)))
  }

  // ── Flush ─────────────────────────────────────────────────────────────

  async fn flush(self: &Arc<Self>, complete: bool) -> Result<()> {
    tracing::debug!("begin flush");
    lock(&self.state).flushing = true;
    let result = self.flush_all(complete).await;
    lock(&self.state).flushing = false;
    tracing::debug!("end flush");
    result
  }

  async fn flush_all(self: &Arc<Self>, complete: bool) -> Result<()> {
    // A case can sit in `pending_loads` after its batch was counted, with
    // nothing left in `pending_cases` to push it out.
    loop {
      self.pool.join().await;
      let (pending, loads) = {
        let mut st = lock(&self.state);
        (std::mem::take(&mut st.pending_cases), std::mem::take(&mut st.pending_loads))
      };
      if pending.is_empty() && loads.is_empty() {
        break;
      }
      if !loads.is_empty() {
        self.load_cases(loads).await?;
      }
      if !pending.is_empty() {
        self.enqueue_or_load(pending).await?;
      }
    }

    if complete {
      tracing::info!("Diffing cases with unprocessed forms...");
      let mut unprocessed = self.store.iter_entities_with_unprocessed_operations();
      while let Some((case_id, num_forms)) = unprocessed.next().await.map_err(Error::store)? {
        self.enqueue(case_id, Some(num_forms)).await?;
      }
    }

    loop {
      let ready = {
        let mut st = lock(&self.state);
        (!st.cases_to_diff.is_empty()).then(|| std::mem::take(&mut st.cases_to_diff))
      };
      if ready.is_none() && self.pool.is_empty() && self.diff_pool.is_empty() {
        break;
      }
      if let Some(batch) = ready {
        self.spawn_diff(batch.into_keys().collect());
      }
      self.pool.join().await;
      self.diff_pool.join().await;
    }
    Ok(())
  }

  // ── Resume state ──────────────────────────────────────────────────────

  async fn load_resume_state(self: &Arc<Self>, resume: ResumeState) -> Result<()> {
    tracing::debug!(?resume, "resume state");
    lock(&self.state).num_diffed = resume.num_diffed_cases;
    for case_id in resume.to_diff {
      self.enqueue(case_id, None).await?;
    }
    let pending: Vec<(String, u32)> = resume.pending.into_iter().collect();
    for chunk in pending.chunks(self.settings.batch_size) {
      self.spawn_load_cases(chunk.iter().cloned().collect());
    }
    Ok(())
  }

  async fn save_resume_state(&self) -> Result<()> {
    let loading = self.case_batcher.batches();
    let diffing = self.diff_batcher.batches();
    let state = {
      let st = lock(&self.state);
      let mut pending = st.pending_cases.clone();
      for batch in loading.iter().chain([&st.pending_loads]) {
        for (id, n) in batch {
          *pending.entry(id.clone()).or_default() += n;
        }
      }
      let mut seen = HashSet::new();
      let to_diff = diffing
        .into_iter()
        .flatten()
        .chain(st.cases_to_diff.keys().cloned())
        .filter(|id| seen.insert(id.clone()))
        .collect();
      ResumeState { pending, to_diff, num_diffed_cases: st.num_diffed }
    };

    let value = serde_json::to_value(&state)?;
    if let Err(err) = self.store.set_resume_state(RESUME_KEY.into(), value).await {
      tracing::warn!(?state, "unable to save state");
      return Err(Error::store(err));
    }
    tracing::debug!(?state, "saved state");
    tracing::info!(
      pending = state.pending.len(),
      to_diff = state.to_diff.len(),
      diffed = state.num_diffed_cases,
      "saved CaseDiffQueue state"
    );
    Ok(())
  }

  // ── Status ────────────────────────────────────────────────────────────

  fn get_status(&self) -> QueueStatus {
    let batched: usize = self.case_batcher.batches().iter().map(Counts::len).sum();
    let diffing: usize = self.diff_batcher.batches().iter().map(Vec::len).sum();
    let workers = self.pool.len() + self.diff_pool.len();
    let mut st = lock(&self.state);
    let (hits, total) = std::mem::take(&mut st.cache_hits);
    QueueStatus {
      workers,
      pending: st.pending_cases.len() + st.pending_loads.len() + batched + st.cases_to_diff.len(),
      cached: format!("{hits}/{total}"),
      loaded: st.cache.len() + diffing,
      diffed: st.num_diffed,
      overshoot: st.overshoot,
      received: None,
    }
  }
}

#[cfg(test)]
mod tests {
  use casediff_core::builtin::case_rules;
  use casediff_store_sqlite::{DocFilter, SqliteStateStore};
  use serde_json::Value;

  use super::*;
  use crate::loader::MemoryLoader;

  type Queue = CaseDiffQueue<SqliteStateStore, Arc<MemoryLoader>>;

  struct Fixture {
    store: Arc<SqliteStateStore>,
    old:   Arc<MemoryLoader>,
    new:   Arc<MemoryLoader>,
  }

  fn case(forms: &[&str], name: &str) -> Value {
    json!({"doc_type": CASE_KIND, "xform_ids": forms, "name": name})
  }

  fn ids(ids: &[&str]) -> Vec<String> { ids.iter().map(|id| (*id).to_owned()).collect() }

  fn settings(batch_size: usize) -> QueueSettings {
    QueueSettings { batch_size, status_interval: Duration::ZERO, ..QueueSettings::default() }
  }

  impl Fixture {
    async fn new() -> Self { Self::with_cases(&[("c1", &["f1", "f2", "f3"])]).await }

    async fn with_cases(cases: &[(&str, &[&str])]) -> Self {
      let (mut old, mut new) = (MemoryLoader::new(), MemoryLoader::new());
      for (id, forms) in cases {
        old = old.with(id, case(forms, "a"));
        new = new.with(id, case(forms, "b"));
      }
      Self {
        store: Arc::new(SqliteStateStore::open_in_memory().await.unwrap()),
        old:   Arc::new(old),
        new:   Arc::new(new),
      }
    }

    async fn queue(&self, batch_size: usize) -> Queue {
      CaseDiffQueue::start(
        Arc::clone(&self.store),
        Arc::clone(&self.old),
        Arc::clone(&self.new),
        Arc::new(case_rules()),
        settings(batch_size),
      )
      .await
      .unwrap()
    }

    async fn diffed(&self) -> i64 {
      self.store.counters().await.unwrap().get(CASE_KIND).copied().unwrap_or(0)
    }
  }

  #[tokio::test]
  async fn case_is_diffed_once_after_its_last_form_across_restart() {
    let fx = Fixture::new().await;

    let queue = fx.queue(BATCH_SIZE).await;
    queue.update(&ids(&["c1"]), Some("f1"));
    queue.update(&ids(&["c1"]), Some("f2"));
    queue.set_clean_break();
    queue.finish(false).await.unwrap();
    assert_eq!(fx.diffed().await, 0);

    let queue = fx.queue(BATCH_SIZE).await;
    queue.update(&ids(&["c1"]), Some("f3"));
    queue.finish(false).await.unwrap();

    assert_eq!(fx.diffed().await, 1);
    let diffs = fx.store.doc_diffs(&DocFilter::default()).await.unwrap();
    assert_eq!(diffs.len(), 1);
    assert_eq!(diffs[0].diffs.len(), 1);
    assert_eq!(diffs[0].diffs[0].path, path(["name"]));
    assert_eq!(fx.new.calls(), vec![ids(&["c1"])]);
  }

  #[tokio::test]
  async fn unfinished_case_is_diffed_by_the_sweep() {
    let fx = Fixture::new().await;

    let queue = fx.queue(BATCH_SIZE).await;
    queue.update(&ids(&["c1"]), Some("f1"));
    queue.update(&ids(&["c1"]), Some("f2"));
    queue.set_clean_break();
    queue.finish(false).await.unwrap();

    let queue = fx.queue(BATCH_SIZE).await;
    queue.flush(true).await.unwrap();
    assert_eq!(fx.diffed().await, 1);

    queue.set_clean_break();
    queue.finish(false).await.unwrap();
    assert_eq!(fx.diffed().await, 1);
    assert_eq!(fx.new.calls().len(), 1);
  }

  #[tokio::test]
  async fn complete_flush_loads_cases_left_in_load_batches() {
    let fx = Fixture::with_cases(&[("c1", &["f1"]), ("c2", &["x", "f1"]), ("c3", &["x"])]).await;
    let queue = fx.queue(2).await;

    queue.update(&ids(&["c2", "c3"]), Some("x"));
    queue.inner.pool.join().await;
    queue.update(&ids(&["c1", "c2"]), Some("f1"));
    queue.inner.pool.join().await;

    queue.flush(true).await.unwrap();
    assert_eq!(fx.diffed().await, 3);
    assert!(lock(&queue.inner.state).pending_loads.is_empty());

    queue.set_clean_break();
    queue.finish(false).await.unwrap();
    assert_eq!(fx.diffed().await, 3);
  }

  #[tokio::test]
  async fn extra_forms_are_counted_as_overshoot() {
    let fx = Fixture::new().await;
    let queue = fx.queue(1).await;

    for form in ["f1", "f2", "f3", "f4"] {
      queue.update(&ids(&["c1"]), Some(form));
      queue.inner.pool.join().await;
      queue.inner.diff_pool.join().await;
    }

    let status = queue.get_status();
    assert_eq!(status.overshoot, 1);
    assert_eq!(status.diffed, 2);
    assert!(status.line(0).ends_with(" overshoot=1"));
    queue.finish(false).await.unwrap();
  }

  #[tokio::test]
  async fn diff_is_skipped_when_the_case_gained_forms() {
    let fx = Fixture::with_cases(&[("c1", &["f1"])]).await;
    let queue = fx.queue(1).await;

    queue.update(&ids(&["c1"]), Some("f1"));
    queue.inner.pool.join().await;
    queue.inner.diff_pool.join().await;
    assert_eq!(fx.diffed().await, 1);

    fx.old.insert("c1", case(&["f1", "f2"], "a"));
    queue.enqueue("c1".into()).await.unwrap();
    queue.inner.diff_pool.join().await;
    assert_eq!(fx.diffed().await, 1);
    assert_eq!(fx.store.total_operations("c1".into()).await.unwrap(), Some(2));

    queue.update(&ids(&["c1"]), Some("f2"));
    queue.inner.pool.join().await;
    queue.inner.diff_pool.join().await;
    assert_eq!(fx.diffed().await, 2);
    queue.finish(false).await.unwrap();
  }

  #[tokio::test]
  async fn missing_legacy_case_is_recorded() {
    let fx = Fixture::new().await;
    let queue = fx.queue(BATCH_SIZE).await;
    queue.update(&ids(&["gone"]), Some("f1"));
    queue.finish(false).await.unwrap();

    assert_eq!(fx.store.missing_docs(CASE_KIND).await.unwrap(), ["gone"]);
    let diffs = fx.store.doc_diffs(&DocFilter::default()).await.unwrap();
    assert_eq!(diffs[0].doc_id, "gone");
    assert_eq!(diffs[0].diffs, vec![Diff::new(
      DiffType::Missing,
      path(["*"]),
      None,
      Some(json!("?")),
    )]);
  }

  #[tokio::test]
  async fn load_failures_are_retried() {
    let fx = Fixture::new().await;
    fx.old.fail_next(2);
    let queue = fx.queue(1).await;
    for form in ["f1", "f2", "f3"] {
      queue.update(&ids(&["c1"]), Some(form));
      queue.inner.pool.join().await;
    }
    queue.finish(false).await.unwrap();

    assert_eq!(fx.diffed().await, 1);
    assert_eq!(fx.old.calls().len(), 3);
  }

  #[tokio::test]
  async fn small_cases_are_diffed_from_cache() {
    let fx = Fixture::new().await;
    let queue = fx.queue(1).await;

    queue.update(&ids(&["c1"]), Some("f1"));
    queue.inner.pool.join().await;
    queue.update(&ids(&["c1"]), Some("f2"));
    queue.inner.pool.join().await;
    queue.update(&ids(&["c1"]), Some("f3"));
    queue.inner.pool.join().await;
    queue.inner.diff_pool.join().await;

    let status = queue.get_status();
    assert_eq!(status.cached, "1/1");
    assert_eq!(status.diffed, 1);
    assert_eq!(fx.old.calls(), vec![ids(&["c1"])]);
    queue.finish(false).await.unwrap();
    assert_eq!(fx.diffed().await, 1);
  }

  #[tokio::test]
  async fn error_exit_saves_pending_cases() {
    let fx = Fixture::new().await;

    let queue = fx.queue(BATCH_SIZE).await;
    for form in ["f1", "f2", "f3"] {
      queue.update(&ids(&["c1"]), Some(form));
    }
    queue.finish(true).await.unwrap();
    assert_eq!(fx.diffed().await, 0);

    let queue = fx.queue(BATCH_SIZE).await;
    queue.finish(false).await.unwrap();
    assert_eq!(fx.diffed().await, 1);
    assert_eq!(queue.get_status().diffed, 1);
  }

  #[tokio::test]
  async fn second_queue_cannot_resume_unsaved_state() {
    let fx = Fixture::new().await;
    let _first = fx.queue(BATCH_SIZE).await;
    let second = CaseDiffQueue::start(
      Arc::clone(&fx.store),
      Arc::clone(&fx.old),
      Arc::clone(&fx.new),
      Arc::new(case_rules()),
      settings(BATCH_SIZE),
    )
    .await;
    assert!(matches!(second, Err(Error::Store(_))));
  }

  #[tokio::test]
  async fn oversized_batch_settings_are_rejected() {
    let fx = Fixture::new().await;
    let result = CaseDiffQueue::start(
      Arc::clone(&fx.store),
      Arc::clone(&fx.old),
      Arc::clone(&fx.new),
      Arc::new(RuleSet::new()),
      QueueSettings { batch_size: 10, max_memorized_cases: 10, ..settings(10) },
    )
    .await;
    assert!(matches!(result, Err(Error::Settings(_))));
  }
}
