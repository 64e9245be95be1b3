//! `casediff replay`: feed an operation log through a case diff sink, and
//! the `queue-worker` child that backs `replay --process`.

use std::{
  path::Path,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  time::Duration,
};

use anyhow::Context as _;
use casediff_queue::{
  CaseDiffPending, CaseDiffProcess, CaseDiffQueue, CaseDiffSink, QueueSettings,
  process::run_case_diff_queue,
};
use casediff_store_sqlite::SqliteStateStore;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::settings::DiffConfig;

/// One migrated operation and the cases it touched.
#[derive(Debug, Deserialize)]
pub struct Operation {
  pub form_id:  Option<String>,
  pub case_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
  InProcess,
  Process,
  Pending,
}

/// First Ctrl+C asks for a clean break, the second aborts.
fn watch_interrupts(on_break: impl Fn() + Send + 'static) {
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_err() {
      return;
    }
    tracing::warn!("clean break requested; press Ctrl+C again to abort");
    on_break();
    if tokio::signal::ctrl_c().await.is_ok() {
      tracing::error!("aborting");
      std::process::abort();
    }
  });
}

pub async fn run(
  cfg: &DiffConfig,
  config_file: &Path,
  domain: &str,
  store: Arc<SqliteStateStore>,
  log: &Path,
  mode: Mode,
) -> anyhow::Result<()> {
  let file = tokio::fs::File::open(log)
    .await
    .with_context(|| format!("failed to open {}", log.display()))?;
  let ops = BufReader::new(file);
  let stop = Arc::new(AtomicBool::new(false));

  match mode {
    Mode::Pending => replay_into(CaseDiffPending::new(store), ops, stop).await,
    Mode::InProcess => {
      let queue = CaseDiffQueue::start(
        store,
        Arc::new(cfg.old_loader(domain)),
        Arc::new(cfg.new_loader(domain)),
        Arc::new(cfg.rules()?),
        cfg.queue_settings(),
      )
      .await?;
      let flag = queue.clean_break_flag();
      let on_stop = Arc::clone(&stop);
      watch_interrupts(move || {
        flag.store(true, Ordering::SeqCst);
        on_stop.store(true, Ordering::SeqCst);
      });
      replay_into(queue, ops, stop).await
    }
    Mode::Process => {
      let exe = std::env::current_exe().context("cannot locate casediff executable")?;
      let store_path = cfg.state_path(domain);
      let (state_dir, docs_dir) = (cfg.state_dir.clone(), cfg.docs_dir.clone());
      let (config_file, domain_arg) = (config_file.to_owned(), domain.to_owned());
      let process = CaseDiffProcess::start(
        store,
        &store_path,
        move |state_path| {
          let mut command = tokio::process::Command::new(exe);
          command
            .arg("--config")
            .arg(config_file)
            .arg("--state-dir")
            .arg(state_dir)
            .arg("--docs-dir")
            .arg(docs_dir)
            .arg("queue-worker")
            .arg(domain_arg)
            .arg("--state-path")
            .arg(state_path);
          command
        },
        cfg.status_interval(),
      )
      .await?;
      // The child gets the same Ctrl+C and makes its own clean break.
      let on_stop = Arc::clone(&stop);
      watch_interrupts(move || on_stop.store(true, Ordering::SeqCst));
      replay_into(process, ops, stop).await
    }
  }
}

/// Send every operation in `ops` to `sink`, then finish it. A failure while
/// replaying finishes the sink with an error.
async fn replay_into<K, R>(sink: K, ops: R, stop: Arc<AtomicBool>) -> anyhow::Result<()>
where
  K: CaseDiffSink,
  R: AsyncBufRead + Unpin,
{
  let mut lines = ops.lines();
  let mut replayed = 0_u64;
  let outcome: anyhow::Result<()> = async {
    while let Some(line) = lines.next_line().await? {
      if stop.load(Ordering::SeqCst) {
        sink.clean_break();
        break;
      }
      if line.trim().is_empty() {
        continue;
      }
      let op: Operation = serde_json::from_str(&line)
        .with_context(|| format!("bad operation after {replayed} replayed"))?;
      sink.update(op.case_ids, op.form_id).await?;
      replayed += 1;
    }
    Ok(())
  }
  .await;

  tracing::info!("replayed {replayed} operations");
  match outcome {
    Ok(()) => Ok(sink.close(false).await?),
    Err(err) => {
      if let Err(finish_err) = sink.close(true).await {
        tracing::error!(error = %finish_err, "failed to finish case diffs");
      }
      Err(err)
    }
  }
}

/// Child side of `replay --process`: serve a queue on stdin and stdout.
pub async fn run_worker(cfg: &DiffConfig, domain: &str, state_path: &Path) -> anyhow::Result<()> {
  let store = SqliteStateStore::open(state_path)
    .await
    .with_context(|| format!("failed to open store at {state_path:?}"))?;
  // The parent logs status for us.
  let settings = QueueSettings { status_interval: Duration::ZERO, ..cfg.queue_settings() };
  let queue = CaseDiffQueue::start(
    Arc::new(store),
    Arc::new(cfg.old_loader(domain)),
    Arc::new(cfg.new_loader(domain)),
    Arc::new(cfg.rules()?),
    settings,
  )
  .await?;
  let flag = queue.clean_break_flag();
  tokio::spawn(async move {
    while tokio::signal::ctrl_c().await.is_ok() {
      if !flag.swap(true, Ordering::SeqCst) {
        tracing::warn!("clean break requested");
      }
    }
  });
  run_case_diff_queue(queue, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await?;
  Ok(())
}
