//! Schema-aware record store over a storage engine.

use crate::constants::{datadb_schemas, DATADB_NAME, DATADB_VERSION};
use crate::engine::{Database, StorageEngine, Transaction, TransactionMode, UpgradeTransaction};
use crate::error::{DataDbError, Result};
use crate::schema::{migration, CollectionSpec, Schema, SchemaHistory};
use crate::types::{Key, KeyRange, Record};
use serde::Serialize;
use tokio::sync::OnceCell;

/// A lazily opened database declared by a schema.
///
/// The database handle is opened on first use and shared by every later
/// call. Each operation runs in its own transaction scoped to the one
/// collection it touches; writes return only after the commit completes.
pub struct RecordStore<E: StorageEngine> {
    engine: E,
    name: String,
    version: u32,
    schema: Schema,
    db: OnceCell<E::Database>,
}

impl<E: StorageEngine> RecordStore<E> {
    /// Create a store. Nothing is opened until the first operation.
    pub fn new(engine: E, name: impl Into<String>, version: u32, schema: Schema) -> Self {
        Self {
            engine,
            name: name.into(),
            version,
            schema,
            db: OnceCell::new(),
        }
    }

    /// Create a store using the schema `history` declares for `version`.
    pub fn from_history(
        engine: E,
        name: impl Into<String>,
        history: &SchemaHistory,
        version: u32,
    ) -> Result<Self> {
        let schema = history
            .find(version)
            .cloned()
            .ok_or(DataDbError::UnknownSchemaVersion(version))?;
        Ok(Self::new(engine, name, version, schema))
    }

    /// The application's data database.
    pub fn data_db(engine: E) -> Result<Self> {
        Self::from_history(engine, DATADB_NAME, &datadb_schemas()?, DATADB_VERSION)
    }

    /// Open `name` at `version`, reconciling the stored collections and
    /// indexes with `schema` if the stored version is older.
    pub async fn open_or_upgrade(
        engine: &E,
        name: &str,
        version: u32,
        schema: &Schema,
    ) -> Result<E::Database> {
        let upgrade = |tx: &mut dyn UpgradeTransaction| -> Result<()> {
            let from = tx.old_version();
            let steps = migration::reconcile(tx, schema)?;
            tracing::info!(db = name, from, to = version, steps = steps.len(), "reconciled schema");
            Ok(())
        };
        engine.open(name, version, &upgrade).await
    }

    /// The memoized database handle, opened on first call.
    ///
    /// Concurrent first callers share one open. A failed open is retried by
    /// the next caller.
    pub async fn database(&self) -> Result<&E::Database> {
        self.db
            .get_or_try_init(|| Self::open_or_upgrade(&self.engine, &self.name, self.version, &self.schema))
            .await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Whether the handle has been opened yet.
    pub fn is_open(&self) -> bool {
        self.db.initialized()
    }

    // --- Reads ---

    /// Look a record up by primary key.
    pub async fn get(&self, collection: &str, key: impl Into<Key>) -> Result<Option<Record>> {
        self.declared(collection)?;
        let key = key.into();
        key.validate()?;

        let tx = self.begin(collection, TransactionMode::ReadOnly).await?;
        let record = tx.get(collection, &key)?;
        tracing::debug!(db = %self.name, collection, key = %key, found = record.is_some(), "get");
        Ok(record)
    }

    /// First record, in index order, whose `index` key equals `value`.
    pub async fn get_by_index(
        &self,
        collection: &str,
        index: &str,
        value: impl Into<Key>,
    ) -> Result<Option<Record>> {
        self.declared(collection)?;
        let value = value.into();
        value.validate()?;

        let tx = self.begin(collection, TransactionMode::ReadOnly).await?;
        let record = tx.get_by_index(collection, index, &value)?;
        tracing::debug!(db = %self.name, collection, index, value = %value, found = record.is_some(), "get by index");
        Ok(record)
    }

    /// Every record of `collection` in primary key order, optionally bounded.
    pub async fn get_all(&self, collection: &str, range: Option<&KeyRange>) -> Result<Vec<Record>> {
        self.declared(collection)?;

        let tx = self.begin(collection, TransactionMode::ReadOnly).await?;
        let records = tx.get_all(collection, range)?;
        tracing::debug!(db = %self.name, collection, count = records.len(), "get all");
        Ok(records)
    }

    // --- Writes ---

    /// Insert a new record, returning its key.
    ///
    /// The key comes from the record's inline key path or from the
    /// collection's key generator.
    pub async fn add<T: Serialize + ?Sized>(&self, collection: &str, data: &T) -> Result<Key> {
        self.declared(collection)?;
        let record = serde_json::to_value(data)?;

        let mut tx = self.begin(collection, TransactionMode::ReadWrite).await?;
        let key = tx.add(collection, record, None)?;
        tx.commit().await?;
        tracing::debug!(db = %self.name, collection, key = %key, "add");
        Ok(key)
    }

    /// Insert or replace a record.
    ///
    /// `key` must be given exactly when the collection has no inline key path.
    pub async fn put<T: Serialize + ?Sized>(
        &self,
        collection: &str,
        data: &T,
        key: Option<Key>,
    ) -> Result<Key> {
        let spec = self.declared(collection)?;
        check_key_usage(collection, spec.options.is_inline(), key.as_ref())?;
        if let Some(key) = &key {
            key.validate()?;
        }
        let record = serde_json::to_value(data)?;

        let mut tx = self.begin(collection, TransactionMode::ReadWrite).await?;
        // The stored collection decides; its options never change after creation.
        let stored = tx.key_path(collection)?;
        check_key_usage(collection, stored.is_some(), key.as_ref())?;
        let key = tx.put(collection, record, key)?;
        tx.commit().await?;
        tracing::debug!(db = %self.name, collection, key = %key, "put");
        Ok(key)
    }

    /// Remove a record. Absent keys are not an error.
    pub async fn delete(&self, collection: &str, key: impl Into<Key>) -> Result<()> {
        self.declared(collection)?;
        let key = key.into();
        key.validate()?;

        let mut tx = self.begin(collection, TransactionMode::ReadWrite).await?;
        tx.delete(collection, &key)?;
        tx.commit().await?;
        tracing::debug!(db = %self.name, collection, key = %key, "delete");
        Ok(())
    }

    // --- Internal Helpers ---

    fn declared(&self, collection: &str) -> Result<&CollectionSpec> {
        self.schema
            .collection(collection)
            .ok_or_else(|| DataDbError::UnknownCollection(collection.to_string()))
    }

    async fn begin(
        &self,
        collection: &str,
        mode: TransactionMode,
    ) -> Result<<E::Database as Database>::Transaction> {
        let db = self.database().await?;
        db.transaction(&[collection], mode).await
    }
}

/// A key is given to `put` exactly when records don't carry one inline.
fn check_key_usage(collection: &str, inline: bool, key: Option<&Key>) -> Result<()> {
    let reason = match (inline, key) {
        (true, Some(_)) => "records carry their key inline; no key may be given",
        (false, None) => "collection has no key path; a key is required",
        _ => return Ok(()),
    };
    Err(DataDbError::InvalidKeyUsage {
        collection: collection.to_string(),
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LocalEngine;
    use crate::schema::{CollectionSpec, IndexSpec};
    use serde_json::json;

    fn books() -> Schema {
        Schema::new(vec![
            CollectionSpec::new("books")
                .key_path("isbn")
                .index(IndexSpec::new("title")),
            CollectionSpec::new("notes"),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_opens_lazily_and_once() {
        let store = RecordStore::new(LocalEngine::in_memory(), "library", 1, books());
        assert!(!store.is_open());

        let first = store.database().await.unwrap() as *const _;
        let second = store.database().await.unwrap() as *const _;
        assert!(store.is_open());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_validation_happens_before_open() {
        let store = RecordStore::new(LocalEngine::in_memory(), "library", 1, books());

        assert!(matches!(
            store.get("magazines", 1).await,
            Err(DataDbError::UnknownCollection(_))
        ));
        assert!(matches!(
            store.put("books", &json!({"isbn": "1"}), Some(Key::from("1"))).await,
            Err(DataDbError::InvalidKeyUsage { .. })
        ));
        assert!(matches!(
            store.put("notes", &json!({"text": "hi"}), None).await,
            Err(DataDbError::InvalidKeyUsage { .. })
        ));
        assert!(!store.is_open());
    }

    #[tokio::test]
    async fn test_failed_open_is_retried() {
        let engine = std::sync::Arc::new(LocalEngine::in_memory());
        RecordStore::new(std::sync::Arc::clone(&engine), "library", 2, books())
            .database()
            .await
            .unwrap();

        let stale = RecordStore::new(std::sync::Arc::clone(&engine), "library", 1, books());
        assert!(matches!(
            stale.database().await,
            Err(DataDbError::VersionMismatch { .. })
        ));
        assert!(!stale.is_open());
        assert!(stale.database().await.is_err());
    }

    #[tokio::test]
    async fn test_put_follows_stored_key_path() {
        let engine = std::sync::Arc::new(LocalEngine::in_memory());
        let v1 = Schema::new(vec![CollectionSpec::new("notes")]).unwrap();
        RecordStore::new(std::sync::Arc::clone(&engine), "library", 1, v1)
            .put("notes", &json!({"text": "a"}), Some(Key::from(1)))
            .await
            .unwrap();

        // A later declaration can't move keys inline for an existing collection
        let v2 = Schema::new(vec![CollectionSpec::new("notes").key_path("id")]).unwrap();
        let store = RecordStore::new(std::sync::Arc::clone(&engine), "library", 2, v2);
        assert!(matches!(
            store.put("notes", &json!({"id": 2, "text": "b"}), None).await,
            Err(DataDbError::InvalidKeyUsage { .. })
        ));
        assert_eq!(store.get_all("notes", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_nan_keys_rejected_before_open() {
        let store = RecordStore::new(LocalEngine::in_memory(), "library", 1, books());
        let nan = Key::Number(f64::NAN);

        assert!(matches!(
            store.put("notes", &json!({}), Some(nan.clone())).await,
            Err(DataDbError::Data(_))
        ));
        assert!(matches!(store.get("notes", nan.clone()).await, Err(DataDbError::Data(_))));
        assert!(matches!(store.delete("notes", nan).await, Err(DataDbError::Data(_))));
        assert!(!store.is_open());
    }

    #[test]
    fn test_from_history_unknown_version() {
        let history = SchemaHistory::from_json_str(r#"[{"version": 1, "schema": []}]"#).unwrap();
        let result = RecordStore::from_history(LocalEngine::in_memory(), "x", &history, 2);
        assert!(matches!(result, Err(DataDbError::UnknownSchemaVersion(2))));
    }
}
