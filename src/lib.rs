//! tickd: a durable, distributed-safe cron job scheduler.
//!
//! Tasks are registered with a 5-field cron expression and persisted to
//! SQLite. An in-process dispatcher arms one timer per task; each fire takes
//! a Redis lease so that at most one replica in a fleet executes a given
//! tick, then records the outcome and the advanced cron cursor in a single
//! transaction. On boot the dispatcher is rebuilt from the store, with a
//! configurable policy for fire instants missed while the process was down.

pub mod api;
pub mod clock;
pub mod config;
pub mod cron;
pub mod dispatcher;
pub mod error;
pub mod lock;
pub mod recovery;
pub mod runner;
pub mod store;

pub use error::{Error, Result};
