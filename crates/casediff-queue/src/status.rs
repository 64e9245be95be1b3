//! Queue status snapshots and the periodic status logger.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

/// A point-in-time summary of queue progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
  /// Running load and diff jobs.
  pub workers:   usize,
  /// Cases received but not yet loaded or diffed.
  pub pending:   usize,
  /// Cache hits and diffed total since the previous snapshot, as `h/t`.
  pub cached:    String,
  /// Documents held in memory.
  pub loaded:    usize,
  pub diffed:    u64,
  /// Cases whose processed count exceeded their total.
  #[serde(default)]
  pub overshoot: u64,
  /// Cases received over the call channel (child process only).
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub received:  Option<u64>,
}

impl QueueStatus {
  /// Render the status line. `sending` cases still in flight to a child
  /// process are shown as `sending+pending`.
  pub fn line(&self, sending: u64) -> String {
    let pending = if sending > 0 {
      format!("{sending}+{}", self.pending)
    } else {
      self.pending.to_string()
    };
    let mut line = format!(
      "cases pending={pending} cached={} loaded={} workers={} diffed={}",
      self.cached, self.loaded, self.workers, self.diffed
    );
    if self.overshoot > 0 {
      line.push_str(&format!(" overshoot={}", self.overshoot));
    }
    line
  }
}

impl fmt::Display for QueueStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.line(0)) }
}

pub fn log_status(status: &QueueStatus) {
  tracing::info!("{status}");
}

// ─── StatusLogger ────────────────────────────────────────────────────────────

/// Logs a status snapshot every interval until dropped, or until the status
/// source goes away.
pub struct StatusLogger {
  handle: JoinHandle<()>,
}

impl StatusLogger {
  pub fn spawn<F>(interval: Duration, get_status: F) -> Self
  where
    F: Fn() -> Option<QueueStatus> + Send + 'static,
  {
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        match get_status() {
          Some(status) => log_status(&status),
          None => break,
        }
      }
    });
    Self { handle }
  }
}

impl Drop for StatusLogger {
  fn drop(&mut self) { self.handle.abort(); }
}
