//! Storage engine boundary.
//!
//! The record store never touches data directly. It opens a [`Database`]
//! through a [`StorageEngine`], runs upgrades through an
//! [`UpgradeTransaction`], and performs reads and writes inside
//! [`Transaction`]s whose commit it awaits.
//!
//! [`LocalEngine`] is the in-process implementation shipped with the crate.

mod collection;
mod local;

pub use local::{EngineConfig, LocalDatabase, LocalEngine, LocalTransaction};

use crate::error::Result;
use crate::schema::{CollectionOptions, IndexSpec};
use crate::types::{Key, KeyPath, KeyRange, Record};
use async_trait::async_trait;
use std::sync::Arc;

/// Access mode of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

/// Callback run once when a database is opened at a newer version.
pub type UpgradeFn<'a> = dyn Fn(&mut dyn UpgradeTransaction) -> Result<()> + Send + Sync + 'a;

/// Opens databases.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    type Database: Database;

    /// Open `name` at `version`.
    ///
    /// When the stored version is older, `upgrade` runs once inside a single
    /// upgrade transaction; if it fails nothing is changed. Opening below the
    /// stored version fails.
    async fn open(&self, name: &str, version: u32, upgrade: &UpgradeFn<'_>) -> Result<Self::Database>;
}

#[async_trait]
impl<E: StorageEngine + ?Sized> StorageEngine for Arc<E> {
    type Database = E::Database;

    async fn open(&self, name: &str, version: u32, upgrade: &UpgradeFn<'_>) -> Result<Self::Database> {
        (**self).open(name, version, upgrade).await
    }
}

/// Schema changes available while an upgrade is running.
pub trait UpgradeTransaction {
    /// Version the database had before this upgrade (0 when new).
    fn old_version(&self) -> u32;

    fn new_version(&self) -> u32;

    fn collection_names(&self) -> Vec<String>;

    fn create_collection(&mut self, name: &str, options: &CollectionOptions) -> Result<()>;

    fn index_names(&self, collection: &str) -> Result<Vec<String>>;

    fn create_index(&mut self, collection: &str, index: &IndexSpec) -> Result<()>;

    fn delete_index(&mut self, collection: &str, index: &str) -> Result<()>;
}

/// An opened database.
#[async_trait]
pub trait Database: Send + Sync {
    type Transaction: Transaction;

    fn name(&self) -> &str;

    fn version(&self) -> u32;

    fn collection_names(&self) -> Vec<String>;

    /// Start a transaction over `scope`. Waits until conflicting
    /// transactions have finished.
    async fn transaction(&self, scope: &[&str], mode: TransactionMode)
        -> Result<Self::Transaction>;
}

/// A unit of work over a fixed set of collections.
///
/// Dropping a transaction without committing discards its writes.
#[async_trait]
pub trait Transaction: Send {
    fn mode(&self) -> TransactionMode;

    /// Inline key path of a collection in scope.
    fn key_path(&self, collection: &str) -> Result<Option<KeyPath>>;

    fn get(&self, collection: &str, key: &Key) -> Result<Option<Record>>;

    /// First record, in index order, whose index key equals `value`.
    fn get_by_index(&self, collection: &str, index: &str, value: &Key) -> Result<Option<Record>>;

    /// Records in primary key order.
    fn get_all(&self, collection: &str, range: Option<&KeyRange>) -> Result<Vec<Record>>;

    /// Insert a record that must not exist yet.
    fn add(&mut self, collection: &str, record: Record, key: Option<Key>) -> Result<Key>;

    /// Insert or replace a record.
    fn put(&mut self, collection: &str, record: Record, key: Option<Key>) -> Result<Key>;

    /// Remove a record. Missing keys are not an error.
    fn delete(&mut self, collection: &str, key: &Key) -> Result<()>;

    /// Make the writes durable and visible.
    async fn commit(self) -> Result<()>;
}
