//! # DataDb
//!
//! A schema-declared record store over a transactional storage engine.
//!
//! ## Core Concepts
//!
//! - **Collections**: Named sets of records keyed by a primary key
//! - **Indexes**: Secondary lookups derived from a key path in each record
//! - **Schemas**: One declaration per database version, reconciled on upgrade
//! - **Engines**: Pluggable storage behind a small transaction interface
//!
//! ## Example
//!
//! ```ignore
//! use datadb::{LocalEngine, RecordStore};
//! use serde_json::json;
//!
//! let store = RecordStore::data_db(LocalEngine::in_memory())?;
//!
//! let key = store
//!     .add("subtitles", &json!({ "language": "en", "src": "movie.srt" }))
//!     .await?;
//! let found = store.get_by_index("subtitles", "language", "en").await?;
//! ```

pub mod constants;
pub mod engine;
pub mod error;
pub mod schema;
pub mod store;
pub mod types;
pub mod wal;

// Re-exports
pub use engine::{
    Database, EngineConfig, LocalDatabase, LocalEngine, LocalTransaction, StorageEngine,
    Transaction, TransactionMode, UpgradeFn, UpgradeTransaction,
};
pub use error::{DataDbError, Result};
pub use schema::{
    CollectionOptions, CollectionSpec, IndexSpec, MigrationStep, Schema, SchemaHistory,
    VersionedSchema,
};
pub use store::RecordStore;
pub use types::{Key, KeyPath, KeyRange, Record};
