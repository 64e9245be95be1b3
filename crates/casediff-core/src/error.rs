//! Error types for `casediff-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid ignore rule for {kind:?}: {reason}")]
  InvalidRule { kind: String, reason: String },

  #[error("unknown diff type: {0:?}")]
  UnknownDiffType(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
