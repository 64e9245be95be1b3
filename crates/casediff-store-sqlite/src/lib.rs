//! SQLite backend for the case diff state store.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime.

mod encode;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::{DocFilter, SqliteStateStore};

#[cfg(test)]
mod tests;
