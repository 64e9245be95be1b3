//! Running a [`CaseDiffQueue`] in a child process.
//!
//! The parent writes [`Call`]s to the child's stdin and reads [`Report`]s
//! from its stdout, one JSON object per line. The child keeps its own state
//! store next to the parent's (`<name>-casediff.db`); when the child is done
//! the parent copies that state into its own store.

use std::{
  path::{Path, PathBuf},
  process::Stdio,
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
  time::Duration,
};

use casediff_core::{loader::DocumentLoader, store::StateStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
  io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines},
  process::{Child, Command},
  sync::mpsc,
  task::JoinHandle,
};

use crate::{
  CaseDiffQueue, Error, Result,
  queue::{PROCESS_NOT_ALLOWED, STATUS_INTERVAL},
  sink::CaseDiffSink,
  status::QueueStatus,
};

const JOIN_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Protocol ────────────────────────────────────────────────────────────────

/// Parent-to-child messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Call {
  Update { case_ids: Vec<String>, form_id: Option<String> },
  Enqueue { case_id: String },
  Status,
  Terminate { is_error: bool },
}

/// Child-to-parent messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "status", rename_all = "snake_case")]
pub enum Report {
  Status(QueueStatus),
  /// The last message the child sends.
  Terminate(QueueStatus),
}

/// Path of the child's state store for the parent store at `path`.
pub fn casediff_state_path(path: &Path) -> Result<PathBuf> {
  let stem = match (path.extension(), path.file_stem()) {
    (Some(ext), Some(stem)) if ext == "db" => stem.to_string_lossy(),
    _ => return Err(Error::Process(format!("state path must end with .db: {}", path.display()))),
  };
  Ok(path.with_file_name(format!("{stem}-casediff.db")))
}

async fn write_lines<T, W>(mut out: W, mut rx: mpsc::UnboundedReceiver<T>) -> Result<()>
where
  T: Serialize,
  W: AsyncWrite + Unpin,
{
  while let Some(msg) = rx.recv().await {
    let mut line = serde_json::to_vec(&msg)?;
    line.push(b'\n');
    out
      .write_all(&line)
      .await
      .map_err(|err| Error::Process(format!("cannot write to pipe: {err}")))?;
    out.flush().await?;
  }
  Ok(())
}

// ─── Parent side ─────────────────────────────────────────────────────────────

/// A [`CaseDiffQueue`] running in a child process.
///
/// `update` and `enqueue` only queue a message; a broken pipe surfaces as
/// [`Error::Process`] on a later call.
pub struct CaseDiffProcess<S> {
  store:          Arc<S>,
  state_path:     PathBuf,
  calls:          mpsc::UnboundedSender<Call>,
  writer:         JoinHandle<Result<()>>,
  status_logger:  JoinHandle<()>,
  child:          Option<Child>,
  num_cases_sent: Arc<AtomicU64>,
}

impl<S: StateStore + 'static> CaseDiffProcess<S> {
  /// Spawn the command built by `build` for the child store path, and
  /// connect to it over its stdin and stdout.
  ///
  /// Refuses a store that was used directly by an in-process queue.
  pub async fn start(
    store: Arc<S>,
    store_path: &Path,
    build: impl FnOnce(&Path) -> Command,
    status_interval: Duration,
  ) -> Result<Self> {
    let used_directly = store
      .get_value(PROCESS_NOT_ALLOWED.into())
      .await
      .map_err(Error::store)?;
    if matches!(used_directly, Some(Value::Bool(true))) {
      return Err(Error::ProcessNotAllowed(store_path.display().to_string()));
    }
    let state_path = casediff_state_path(store_path)?;

    tracing::debug!("starting case diff process");
    let mut command = build(&state_path);
    command
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::inherit())
      .kill_on_drop(true);
    let mut child = command.spawn()?;
    let stdin = child
      .stdin
      .take()
      .ok_or_else(|| Error::Process("child stdin is not piped".into()))?;
    let stdout = child
      .stdout
      .take()
      .ok_or_else(|| Error::Process("child stdout is not piped".into()))?;

    Ok(Self::connect(store, state_path, stdin, BufReader::new(stdout), Some(child), status_interval))
  }

  /// Talk to a child over the given streams.
  pub fn connect<W, R>(
    store: Arc<S>,
    state_path: PathBuf,
    calls_out: W,
    stats_in: R,
    child: Option<Child>,
    status_interval: Duration,
  ) -> Self
  where
    W: AsyncWrite + Unpin + Send + 'static,
    R: AsyncBufRead + Unpin + Send + 'static,
  {
    let status_interval =
      if status_interval.is_zero() { STATUS_INTERVAL } else { status_interval };
    let (calls, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_lines(calls_out, rx));
    let num_cases_sent = Arc::new(AtomicU64::new(0));
    let status_logger = tokio::spawn(run_status_logger(
      stats_in.lines(),
      calls.clone(),
      Arc::clone(&num_cases_sent),
      status_interval,
    ));
    Self { store, state_path, calls, writer, status_logger, child, num_cases_sent }
  }

  fn send(&self, call: Call) -> Result<()> {
    self
      .calls
      .send(call)
      .map_err(|_| Error::Process("case diff process is not accepting calls".into()))
  }

  pub fn update(&self, case_ids: Vec<String>, form_id: Option<String>) -> Result<()> {
    self.num_cases_sent.fetch_add(case_ids.len() as u64, Ordering::Relaxed);
    self.send(Call::Update { case_ids, form_id })
  }

  pub fn enqueue(&self, case_id: String) -> Result<()> {
    self.num_cases_sent.fetch_add(1, Ordering::Relaxed);
    self.send(Call::Enqueue { case_id })
  }

  pub fn request_status(&self) -> Result<()> {
    tracing::debug!("request status...");
    self.send(Call::Status)
  }

  /// Ask for a final status, terminate the child, wait for it, and copy its
  /// state into the parent store.
  ///
  /// When ending with an error, failures to reach the child are logged
  /// rather than returned.
  pub async fn finish(self, error: bool) -> Result<()> {
    if error {
      tracing::error!("stopping case diff process with error");
    } else {
      tracing::info!("stopping case diff process");
    }
    let mut failure = None;
    for call in [Call::Status, Call::Terminate { is_error: error }] {
      if let Err(err) = self.send(call) {
        tracing::warn!(error = %err, "cannot reach case diff process");
        if !error && failure.is_none() {
          failure = Some(err);
        }
      }
    }

    let Self { store, state_path, calls, mut writer, mut status_logger, child, .. } = self;
    drop(calls);

    if tokio::time::timeout(JOIN_TIMEOUT, &mut status_logger).await.is_err() {
      tracing::warn!("case diff status logger did not stop");
      status_logger.abort();
    }
    match tokio::time::timeout(JOIN_TIMEOUT, &mut writer).await {
      Ok(Ok(Ok(()))) => {}
      Ok(Ok(Err(err))) => {
        tracing::warn!(error = %err, "case diff call channel failed");
        if !error && failure.is_none() {
          failure = Some(err);
        }
      }
      Ok(Err(err)) => tracing::warn!(error = %err, "case diff call writer failed"),
      Err(_) => writer.abort(),
    }
    if let Some(child) = child {
      wait_for_child(child).await;
    }

    if state_path.exists() {
      store.clone_partial_state_from(&state_path).await.map_err(Error::store)?;
      tracing::info!("casediff state copied from {}", state_path.display());
    } else {
      tracing::warn!("case diff process left no state at {}", state_path.display());
    }
    failure.map_or(Ok(()), Err)
  }
}

async fn wait_for_child(mut child: Child) {
  match tokio::time::timeout(JOIN_TIMEOUT, child.wait()).await {
    Ok(Ok(status)) if !status.success() => {
      tracing::warn!(%status, "case diff process exited with failure");
    }
    Ok(Ok(_)) => {}
    Ok(Err(err)) => tracing::warn!(error = %err, "cannot wait for case diff process"),
    Err(_) => {
      tracing::warn!("case diff process did not exit; killing it");
      child.kill().await.ok();
    }
  }
}

/// Log status reports as the child produces them, requesting one whenever
/// none arrived within `interval`. Ends with the child's final report.
async fn run_status_logger<R>(
  mut stats: Lines<R>,
  calls: mpsc::UnboundedSender<Call>,
  num_cases_sent: Arc<AtomicU64>,
  interval: Duration,
) where
  R: AsyncBufRead + Unpin,
{
  let log_status = |status: &QueueStatus| {
    let sent = num_cases_sent.load(Ordering::Relaxed);
    let sending = sent.saturating_sub(status.received.unwrap_or(0));
    tracing::info!("{}", status.line(sending));
  };

  let _ = calls.send(Call::Status);
  loop {
    match tokio::time::timeout(interval, stats.next_line()).await {
      Err(_) => {
        if calls.send(Call::Status).is_err() {
          break;
        }
      }
      Ok(Ok(Some(line))) => match serde_json::from_str::<Report>(&line) {
        Ok(Report::Status(status)) => log_status(&status),
        Ok(Report::Terminate(status)) => {
          log_status(&status);
          break;
        }
        Err(err) => tracing::warn!(error = %err, line, "unreadable report from case diff process"),
      },
      Ok(Ok(None)) => {
        tracing::warn!("case diff process closed its status channel");
        break;
      }
      Ok(Err(err)) => {
        tracing::error!(error = %err, "case diff status channel failed");
        break;
      }
    }
  }
  tracing::info!("casediff process status logger terminated");
}

impl<S: StateStore + 'static> CaseDiffSink for CaseDiffProcess<S> {
  async fn update(&self, case_ids: Vec<String>, form_id: Option<String>) -> Result<()> {
    CaseDiffProcess::update(self, case_ids, form_id)
  }

  async fn enqueue(&self, case_id: String) -> Result<()> { CaseDiffProcess::enqueue(self, case_id) }

  async fn close(self, error: bool) -> Result<()> { CaseDiffProcess::finish(self, error).await }
}

// ─── Child side ──────────────────────────────────────────────────────────────

fn snapshot<S, L>(queue: &CaseDiffQueue<S, L>, received: &AtomicU64) -> QueueStatus
where
  S: StateStore + 'static,
  L: DocumentLoader + 'static,
{
  QueueStatus { received: Some(received.load(Ordering::Relaxed)), ..queue.get_status() }
}

/// Serve `queue` over `calls` and `stats` until the parent terminates it.
///
/// After the terminate call only status requests are answered. The final
/// status is always sent, also when the queue fails.
pub async fn run_case_diff_queue<S, L, R, W>(
  queue: CaseDiffQueue<S, L>,
  calls: R,
  stats: W,
) -> Result<()>
where
  S: StateStore + 'static,
  L: DocumentLoader + 'static,
  R: AsyncBufRead + Unpin + Send + 'static,
  W: AsyncWrite + Unpin + Send + 'static,
{
  let (reports, rx) = mpsc::unbounded_channel();
  let writer = tokio::spawn(write_lines(stats, rx));
  let received = Arc::new(AtomicU64::new(0));
  let mut lines = calls.lines();

  let is_error = loop {
    let line = match lines.next_line().await {
      Ok(Some(line)) => line,
      Ok(None) => {
        tracing::error!("parent closed the call channel");
        break true;
      }
      Err(err) => {
        tracing::error!(error = %err, "call channel failed");
        break true;
      }
    };
    let call = match serde_json::from_str::<Call>(&line) {
      Ok(call) => call,
      Err(err) => {
        tracing::warn!(error = %err, line, "unreadable call");
        continue;
      }
    };
    tracing::debug!(?call, "case diff dispatch");
    match call {
      Call::Update { case_ids, form_id } => {
        received.fetch_add(case_ids.len() as u64, Ordering::Relaxed);
        queue.update(&case_ids, form_id.as_deref());
        tokio::task::yield_now().await;
      }
      Call::Enqueue { case_id } => {
        received.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = queue.enqueue(case_id).await {
          tracing::error!(error = %err, "unexpected error");
          break true;
        }
      }
      Call::Status => {
        let _ = reports.send(Report::Status(snapshot(&queue, &received)));
      }
      Call::Terminate { is_error } => {
        if is_error {
          tracing::error!("stopped due to error in parent process");
        }
        break is_error;
      }
    }
  };

  let consumer = tokio::spawn(answer_status(
    lines,
    queue.clone(),
    Arc::clone(&received),
    reports.clone(),
  ));
  let finished = CaseDiffQueue::finish(&queue, is_error).await;
  consumer.abort();
  let _ = consumer.await;
  if let Err(err) = &finished {
    tracing::error!(error = %err, "unexpected error");
  }

  let status = snapshot(&queue, &received);
  tracing::info!("termination status: {status}");
  let _ = reports.send(Report::Terminate(status));
  drop(reports);
  writer.await??;
  finished
}

/// Answer status requests while the queue shuts down; ignore the rest.
async fn answer_status<S, L, R>(
  mut lines: Lines<R>,
  queue: CaseDiffQueue<S, L>,
  received: Arc<AtomicU64>,
  reports: mpsc::UnboundedSender<Report>,
) where
  S: StateStore + 'static,
  L: DocumentLoader + 'static,
  R: AsyncBufRead + Unpin,
{
  while let Ok(Some(line)) = lines.next_line().await {
    match serde_json::from_str::<Call>(&line) {
      Ok(Call::Status) => {
        let _ = reports.send(Report::Status(snapshot(&queue, &received)));
      }
      Ok(call) => tracing::warn!(?call, "ignoring call after terminate"),
      Err(err) => tracing::warn!(error = %err, line, "unreadable call"),
    }
  }
}

#[cfg(test)]
mod tests {
  use casediff_core::builtin::{CASE_KIND, case_rules};
  use casediff_store_sqlite::SqliteStateStore;
  use serde_json::json;

  use super::*;
  use crate::{QueueSettings, loader::MemoryLoader};

  #[test]
  fn child_state_lives_next_to_parent_state() {
    let path = casediff_state_path(Path::new("/state/db/demo.db")).unwrap();
    assert_eq!(path, Path::new("/state/db/demo-casediff.db"));
    assert!(casediff_state_path(Path::new("/state/db/demo.sqlite")).is_err());
  }

  #[test]
  fn calls_are_tagged_by_action() {
    let call = Call::Update { case_ids: vec!["c1".into()], form_id: Some("f1".into()) };
    let line = serde_json::to_string(&call).unwrap();
    assert_eq!(line, r#"{"action":"update","case_ids":["c1"],"form_id":"f1"}"#);
    let status: Report =
      serde_json::from_str(r#"{"action":"terminate","status":{"workers":0,"pending":0,"cached":"0/0","loaded":0,"diffed":3}}"#)
        .unwrap();
    assert!(matches!(status, Report::Terminate(QueueStatus { diffed: 3, .. })));
  }

  #[tokio::test]
  async fn store_used_directly_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("demo.db");
    let store = Arc::new(SqliteStateStore::open(&path).await.unwrap());
    store.set_value(PROCESS_NOT_ALLOWED.into(), json!(true)).await.unwrap();

    let result =
      CaseDiffProcess::start(store, &path, |_| Command::new("true"), Duration::from_secs(1)).await;
    assert!(matches!(result, Err(Error::ProcessNotAllowed(_))));
  }

  #[tokio::test]
  async fn child_state_is_copied_into_parent_store() {
    let dir = tempfile::tempdir().unwrap();
    let parent_path = dir.path().join("demo.db");
    let state_path = casediff_state_path(&parent_path).unwrap();
    let parent = Arc::new(SqliteStateStore::open(&parent_path).await.unwrap());
    let child_store = Arc::new(SqliteStateStore::open(&state_path).await.unwrap());

    let old = MemoryLoader::new()
      .with("c1", json!({"doc_type": CASE_KIND, "xform_ids": ["f1", "f2"], "name": "a"}));
    let new = MemoryLoader::new()
      .with("c1", json!({"doc_type": CASE_KIND, "xform_ids": ["f1", "f2"], "name": "b"}));
    let queue = CaseDiffQueue::start(
      child_store,
      old,
      new,
      Arc::new(case_rules()),
      QueueSettings { status_interval: Duration::ZERO, ..QueueSettings::default() },
    )
    .await
    .unwrap();

    let (parent_out, child_in) = tokio::io::duplex(4096);
    let (child_out, parent_in) = tokio::io::duplex(4096);
    let child = tokio::spawn(run_case_diff_queue(queue, BufReader::new(child_in), child_out));
    let process = CaseDiffProcess::connect(
      Arc::clone(&parent),
      state_path,
      parent_out,
      BufReader::new(parent_in),
      None,
      Duration::from_secs(60),
    );

    process.update(vec!["c1".into()], Some("f1".into())).unwrap();
    process.update(vec!["c1".into()], Some("f2".into())).unwrap();
    process.finish(false).await.unwrap();
    child.await.unwrap().unwrap();

    assert_eq!(parent.counters().await.unwrap()[CASE_KIND], 1);
    assert_eq!(parent.ids_with_diffs(&[]).await.unwrap(), ["c1"]);
    assert_eq!(parent.total_operations("c1".into()).await.unwrap(), Some(2));
  }
}
