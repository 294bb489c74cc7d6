//! SQLite ledger of sync state.
//!
//! Tracks the last classification of every manifest asset, a history of sync
//! runs and the small amount of engine state that must survive a restart
//! (applied manifest version, download failure streak). The filesystem stays
//! the source of truth for asset validity; the ledger is for status
//! reporting and restart decisions.

pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::{SqliteStateDb, StateDb};
pub use error::StateError;
pub use types::{AssetRecord, LedgerSummary, RunTrigger, SyncRunStats};
