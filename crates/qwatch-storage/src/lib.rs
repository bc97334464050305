//! SQLite persistence for the alerting core.
//!
//! [`SqliteAlertStore`] implements [`qwatch_alert::AlertStore`] on a single
//! database file. Every state transition runs inside a `BEGIN IMMEDIATE`
//! transaction, so several processes pointing at the same file see each
//! operation as atomic.

pub mod error;
pub mod store;


pub use error::{Result, StorageError};
pub use store::SqliteAlertStore;
