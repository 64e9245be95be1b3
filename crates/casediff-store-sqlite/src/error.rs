//! Error type for `casediff-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] casediff_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  /// The resume state was popped by a run that never saved it back. Starting
  /// over would lose track of in-flight cases.
  #[error("resume not allowed for {0:?}: the previous run did not save its state")]
  ResumeNotAllowed(String),

  /// A child store holds data the clone routine was not written to handle.
  #[error("refusing to clone state: {0}")]
  CloneNotAllowed(String),

  #[error("invalid stored value: {0}")]
  Corrupt(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
