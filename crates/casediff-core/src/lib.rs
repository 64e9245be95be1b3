//! Core types and trait definitions for the case diff pipeline.
//!
//! This crate is deliberately free of database and process dependencies.
//! It holds the structural differ, the ignore-rule engine, the bounded
//! document cache and the traits the queue consumes: a bulk
//! [`DocumentLoader`](loader::DocumentLoader) and a resumable
//! [`StateStore`](store::StateStore).

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod builtin;
pub mod case;
pub mod diff;
pub mod error;
pub mod loader;
pub mod lru;
pub mod rule;
pub mod store;

pub use error::{Error, Result};
