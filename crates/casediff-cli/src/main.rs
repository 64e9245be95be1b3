//! `casediff`: diff migrated cases against their legacy documents.
//!
//! # Usage
//!
//! ```
//! casediff cases demo --select pending
//! casediff replay demo operations.jsonl --process
//! casediff show demo --select CommCareCase:c1,c2 --csv
//! ```

mod cases;
mod replay;
mod settings;
mod show;

use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use casediff_store_sqlite::SqliteStateStore;
use cases::{Loaders, Selection};
use clap::{Parser, Subcommand};
use replay::Mode;
use settings::{DiffConfig, Overrides};
use show::KindSelection;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

// ─── CLI args ─────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(author, version, about = "Diff migrated cases against legacy documents")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "casediff.toml")]
  config: PathBuf,

  /// Directory holding the state databases.
  #[arg(long, env = "CASEDIFF_STATE_DIR")]
  state_dir: Option<PathBuf>,

  /// Root of the old and new document directories.
  #[arg(long)]
  docs_dir: Option<PathBuf>,

  /// Log at debug level unless RUST_LOG says otherwise.
  #[arg(long)]
  debug: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Diff selected cases directly.
  Cases {
    domain:     String,
    /// pending, with-diffs, with-changes, a comma list of ids, or a file
    /// path (`/...` or `./...`) with one id per line.
    #[arg(long, default_value = "pending")]
    select:     Selection,
    /// Diff one batch at a time and stop at the first case with diffs.
    #[arg(long)]
    stop:       bool,
    #[arg(long)]
    batch_size: Option<u64>,
  },
  /// Feed a JSON-lines operation log through the case diff queue.
  Replay {
    domain:  String,
    log:     PathBuf,
    /// Run the queue in a child process.
    #[arg(long, conflicts_with = "pending")]
    process: bool,
    /// Only record the touched cases for a later `cases` run.
    #[arg(long)]
    pending: bool,
  },
  /// Print stored diffs.
  Show {
    domain:  String,
    /// Print changes instead of diffs.
    #[arg(long)]
    changes: bool,
    #[arg(long)]
    csv:     bool,
    /// `kind[:id,id,...]`
    #[arg(long)]
    select:  Option<KindSelection>,
  },
  /// Re-apply the ignore rules to stored diffs.
  Filter {
    domain:  String,
    #[arg(long)]
    dry_run: bool,
  },
  /// Delete all diff state for a domain.
  Reset { domain: String },
  #[command(hide = true)]
  QueueWorker {
    domain:     String,
    #[arg(long)]
    state_path: PathBuf,
  },
}

// ─── Entry point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let cli = Cli::parse();

  // Stdout belongs to the stats channel in the queue worker.
  let level = if cli.debug { LevelFilter::DEBUG } else { LevelFilter::INFO };
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_env_filter(EnvFilter::builder().with_default_directive(level.into()).from_env_lossy())
    .init();

  let batch_size = match &cli.command {
    Command::Cases { batch_size, .. } => *batch_size,
    _ => None,
  };
  let cfg = DiffConfig::load(&cli.config, Overrides {
    state_dir: cli.state_dir,
    docs_dir: cli.docs_dir,
    batch_size,
  })?;

  if let Command::QueueWorker { domain, state_path } = &cli.command {
    return replay::run_worker(&cfg, domain, state_path).await;
  }

  let domain = match &cli.command {
    Command::Cases { domain, .. }
    | Command::Replay { domain, .. }
    | Command::Show { domain, .. }
    | Command::Filter { domain, .. }
    | Command::Reset { domain }
    | Command::QueueWorker { domain, .. } => domain.clone(),
  };
  let store = Arc::new(open_store(&cfg, &domain).await?);

  match cli.command {
    Command::Cases { select, stop, .. } => {
      let loaders = Loaders {
        old: Arc::new(cfg.old_loader(&domain)),
        new: Arc::new(cfg.new_loader(&domain)),
      };
      let rules = Arc::new(cfg.rules()?);
      cases::run(
        Arc::clone(&store),
        loaders,
        rules,
        &select,
        cfg.batch_size,
        cfg.max_diff_workers,
        stop,
      )
      .await?;
      cases::check_undiffed(&store, &select).await?;
    }
    Command::Replay { log, process, pending, .. } => {
      let mode = match (process, pending) {
        (true, _) => Mode::Process,
        (_, true) => Mode::Pending,
        _ => Mode::InProcess,
      };
      replay::run(&cfg, &cli.config, &domain, store, &log, mode).await?;
    }
    Command::Show { changes, csv, select, .. } => {
      let filter = select.map(|s| s.0).unwrap_or_default();
      show::show(&store, &filter, changes, csv).await?;
    }
    Command::Filter { dry_run, .. } => {
      let rules = cfg.rules()?;
      let report = show::filter(
        &store,
        &cfg.old_loader(&domain),
        &cfg.new_loader(&domain),
        &rules,
        dry_run,
      )
      .await?;
      let verb = if dry_run { "would remove" } else { "removed" };
      tracing::info!(
        "{verb} {} diffs ({} as changes) from {} documents; {} documents could not be loaded",
        report.removed,
        report.changes,
        report.docs,
        report.skipped,
      );
    }
    Command::Reset { .. } => {
      store.reset().await?;
      tracing::info!("reset diff state for {domain}");
    }
    Command::QueueWorker { .. } => {}
  }
  Ok(())
}

async fn open_store(cfg: &DiffConfig, domain: &str) -> anyhow::Result<SqliteStateStore> {
  let path = cfg.state_path(domain);
  if let Some(dir) = path.parent() {
    tokio::fs::create_dir_all(dir)
      .await
      .with_context(|| format!("failed to create {}", dir.display()))?;
  }
  SqliteStateStore::open(&path)
    .await
    .with_context(|| format!("failed to open store at {path:?}"))
}
