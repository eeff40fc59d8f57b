//! # parley-store
//!
//! The shared, persistent signaling store for parley calls.
//!
//! Call records and their two append-only candidate sequences live in a
//! SQLite database. The crate exposes a synchronous `Database` handle with
//! typed CRUD helpers, and the async [`SignalingChannel`] contract with its
//! SQLite-backed implementation that adds change-watch subscriptions.

pub mod calls;
pub mod candidates;
pub mod channel;
pub mod database;
pub mod migrations;
pub mod watch;

mod error;

pub use channel::{SignalingChannel, SqliteChannel};
pub use database::Database;
pub use error::{Result, StoreError};
pub use watch::{CallFilter, Subscription};
