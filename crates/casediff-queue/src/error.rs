//! Error type for `casediff-queue`.

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
  #[error("store error: {0}")]
  Store(#[source] BoxError),

  #[error("loader error: {0}")]
  Loader(#[source] BoxError),

  /// The channel to or from a case diff process is broken.
  #[error("case diff process error: {0}")]
  Process(String),

  #[error("{0} was previously used directly by CaseDiffQueue")]
  ProcessNotAllowed(String),

  #[error("batch failed after {attempts} attempts: {source}")]
  BatchFailed {
    attempts: u32,
    #[source]
    source:   Box<Error>,
  },

  #[error("invalid queue settings: {0}")]
  Settings(String),

  #[error("queue is shut down")]
  ShutDown,

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("task failed: {0}")]
  Join(#[from] tokio::task::JoinError),
}

impl Error {
  pub fn store(err: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::Store(Box::new(err))
  }

  pub fn loader(err: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::Loader(Box::new(err))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
