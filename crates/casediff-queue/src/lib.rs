//! The case diff queue and the machinery around it.
//!
//! [`CaseDiffQueue`] diffs each case once all operations touching it have
//! been processed. [`CaseDiffProcess`] runs a queue in a child process, and
//! [`CaseDiffPending`] only records cases in the durable diff queue for a
//! later run. All three implement [`CaseDiffSink`].

pub mod batch;
pub mod casediff;
pub mod error;
pub mod loader;
pub mod pool;
pub mod process;
pub mod queue;
pub mod sink;
pub mod status;

pub use error::{Error, Result};
pub use process::CaseDiffProcess;
pub use queue::{CaseDiffQueue, QueueSettings};
pub use sink::{CaseDiffPending, CaseDiffSink};
pub use status::QueueStatus;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock `mutex`, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
