//! # blum-store
//!
//! Durable local storage for the blum service: one `SQLite` file per service
//! instance holding versioned records grouped by namespace.
//!
//! - Optimistic concurrency on every write ([`StoreError::VersionConflict`])
//! - Atomic batches via [`RecordStore::transaction`]
//! - WAL journaling, so a killed process never leaves a torn record

#![deny(unsafe_code)]

pub mod database;
pub mod error;
pub mod records;
pub mod row_helpers;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
pub use records::{BatchConflict, RecordStore, StoreOp, StoreRecord, TransactionOutcome};
