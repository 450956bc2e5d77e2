//! In-process storage engine.
//!
//! Each database is a catalog of collections, each behind its own async
//! read-write lock: read-only transactions share a collection, read-write
//! transactions hold it exclusively until they commit or are dropped. Locks
//! are always taken in collection-name order.
//!
//! With a configured path, every database lives in its own directory:
//!
//! ```text
//! <path>/<name>/MANIFEST      magic + format version
//! <path>/<name>/LOCK          exclusive process lock
//! <path>/<name>/snapshot.bin  last checkpoint
//! <path>/<name>/data.wal      commits and upgrades since the checkpoint
//! ```

use crate::engine::collection::{CollectionData, CollectionImage};
use crate::engine::{Database, StorageEngine, Transaction, TransactionMode, UpgradeFn, UpgradeTransaction};
use crate::error::{DataDbError, Result};
use crate::schema::{CollectionOptions, IndexSpec, MigrationStep};
use crate::types::{Key, KeyPath, KeyRange, Record};
use crate::wal::{WalOperation, WriteAheadLog, WriteOp};
use async_trait::async_trait;
use fs2::FileExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{
    Mutex as AsyncMutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock as AsyncRwLock,
};

/// Magic bytes for the database manifest.
const MANIFEST_MAGIC: &[u8; 4] = b"DDB\0";

/// Current database format version.
const MANIFEST_VERSION: u8 = 1;

/// Magic bytes for checkpoint snapshots.
const SNAPSHOT_MAGIC: &[u8; 4] = b"DSN\0";

/// Current snapshot format version.
const SNAPSHOT_VERSION: u8 = 1;

const MANIFEST_FILE: &str = "MANIFEST";
const LOCK_FILE: &str = "LOCK";
const SNAPSHOT_FILE: &str = "snapshot.bin";
const WAL_FILE: &str = "data.wal";

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Root directory for databases. `None` keeps everything in memory.
    pub path: Option<PathBuf>,

    /// Whether to create a database directory that doesn't exist.
    pub create_if_missing: bool,

    /// Write a checkpoint after this many log entries (0 disables).
    pub checkpoint_every: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: None,
            create_if_missing: true,
            checkpoint_every: 1000,
        }
    }
}

type Slot = Arc<AsyncRwLock<CollectionData>>;

struct Catalog {
    version: u32,
    collections: BTreeMap<String, Slot>,
}

/// Persisted form of a whole database.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DatabaseImage {
    version: u32,
    collections: Vec<(String, CollectionImage)>,
}

struct Persistence {
    dir: PathBuf,
    wal: Arc<WriteAheadLog>,
    checkpoint_every: u64,
    _lock_file: File,
}

/// State shared by every handle to one database.
struct DatabaseShared {
    name: String,
    catalog: RwLock<Catalog>,
    /// Serializes upgrades and checkpoints.
    upgrade_lock: AsyncMutex<()>,
    persistence: Option<Persistence>,
}

/// The in-process storage engine.
pub struct LocalEngine {
    config: EngineConfig,
    databases: AsyncMutex<HashMap<String, Arc<DatabaseShared>>>,
}

impl LocalEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            databases: AsyncMutex::new(HashMap::new()),
        }
    }

    /// An engine that keeps every database in memory.
    pub fn in_memory() -> Self {
        Self::new(EngineConfig::default())
    }

    /// An engine persisting databases under `path`.
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Self::new(EngineConfig {
            path: Some(path.into()),
            ..Default::default()
        })
    }

    async fn shared(&self, name: &str) -> Result<Arc<DatabaseShared>> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(DataDbError::Data(format!("invalid database name {:?}", name)));
        }

        // Held across the load so one database is never loaded twice.
        let mut databases = self.databases.lock().await;
        if let Some(db) = databases.get(name) {
            return Ok(Arc::clone(db));
        }
        let config = self.config.clone();
        let owned = name.to_string();
        let db = tokio::task::spawn_blocking(move || DatabaseShared::load(&owned, &config)).await??;
        let db = Arc::new(db);
        databases.insert(name.to_string(), Arc::clone(&db));
        Ok(db)
    }
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[async_trait]
impl StorageEngine for LocalEngine {
    type Database = LocalDatabase;

    async fn open(&self, name: &str, version: u32, upgrade: &UpgradeFn<'_>) -> Result<LocalDatabase> {
        if version == 0 {
            return Err(DataDbError::InvalidVersion(version));
        }
        let shared = self.shared(name).await?;
        shared.upgrade(version, upgrade).await?;
        tracing::info!(db = name, version, "opened database");
        Ok(LocalDatabase { shared, version })
    }
}

impl DatabaseShared {
    fn new(
        name: &str,
        version: u32,
        collections: BTreeMap<String, CollectionData>,
        persistence: Option<Persistence>,
    ) -> Self {
        let collections = collections
            .into_iter()
            .map(|(name, data)| (name, Arc::new(AsyncRwLock::new(data))))
            .collect();
        Self {
            name: name.to_string(),
            catalog: RwLock::new(Catalog {
                version,
                collections,
            }),
            upgrade_lock: AsyncMutex::new(()),
            persistence,
        }
    }

    fn load(name: &str, config: &EngineConfig) -> Result<Self> {
        let root = match &config.path {
            Some(root) => root,
            None => return Ok(Self::new(name, 0, BTreeMap::new(), None)),
        };

        let dir = root.join(name);
        if dir.exists() {
            verify_manifest(&dir)?;
        } else if config.create_if_missing {
            fs::create_dir_all(&dir)?;
            write_manifest(&dir)?;
        } else {
            return Err(DataDbError::NotInitialized);
        }

        let lock_file = acquire_lock(&dir)?;

        let image = read_snapshot(&dir)?;
        let mut version = image.version;
        let mut collections = BTreeMap::new();
        for (collection, image) in image.collections {
            let data = CollectionData::from_image(&collection, image)?;
            collections.insert(collection, data);
        }

        let wal = WriteAheadLog::open(dir.join(WAL_FILE))?;
        let entries = wal.entries()?;
        let replayed = entries.len();
        for entry in entries {
            replay(&mut version, &mut collections, entry.operation)?;
        }

        tracing::info!(
            db = name,
            version,
            collections = collections.len(),
            records = collections.values().map(CollectionData::len).sum::<usize>(),
            replayed,
            "loaded database"
        );

        Ok(Self::new(
            name,
            version,
            collections,
            Some(Persistence {
                dir,
                wal: Arc::new(wal),
                checkpoint_every: config.checkpoint_every,
                _lock_file: lock_file,
            }),
        ))
    }

    fn collection_names(&self) -> Vec<String> {
        self.catalog.read().collections.keys().cloned().collect()
    }

    /// Bring the database to `version`, running `upgrade` when it is newer.
    async fn upgrade(&self, version: u32, upgrade: &UpgradeFn<'_>) -> Result<()> {
        let _upgrading = self.upgrade_lock.lock().await;

        let (stored, slots) = {
            let catalog = self.catalog.read();
            (catalog.version, catalog.collections.clone())
        };
        if version < stored {
            return Err(DataDbError::VersionMismatch {
                requested: version,
                stored,
            });
        }
        if version == stored {
            return Ok(());
        }

        let mut guards = BTreeMap::new();
        for (name, slot) in slots {
            guards.insert(name, slot.write_owned().await);
        }

        let mut tx = LocalUpgrade {
            old_version: stored,
            new_version: version,
            working: guards
                .iter()
                .map(|(name, guard)| (name.clone(), (**guard).clone()))
                .collect(),
            steps: Vec::new(),
        };
        if let Err(e) = upgrade(&mut tx) {
            tracing::warn!(db = %self.name, from = stored, to = version, error = %e, "upgrade aborted");
            return Err(e);
        }

        let LocalUpgrade { working, steps, .. } = tx;
        tracing::info!(
            db = %self.name,
            from = stored,
            to = version,
            steps = steps.len(),
            "upgraded database"
        );
        self.append(WalOperation::Upgrade {
            old_version: stored,
            new_version: version,
            steps,
        })
        .await?;

        let mut created = Vec::new();
        for (name, data) in working {
            match guards.get_mut(&name) {
                Some(guard) => **guard = data,
                None => created.push((name, Arc::new(AsyncRwLock::new(data)))),
            }
        }

        let mut catalog = self.catalog.write();
        catalog.collections.extend(created);
        catalog.version = version;
        Ok(())
    }

    async fn begin(
        self: &Arc<Self>,
        scope: &[&str],
        mode: TransactionMode,
    ) -> Result<LocalTransaction> {
        if scope.is_empty() {
            return Err(DataDbError::Transaction("empty transaction scope".into()));
        }

        let names: BTreeSet<&str> = scope.iter().copied().collect();
        let slots = {
            let catalog = self.catalog.read();
            names
                .iter()
                .map(|name| {
                    catalog
                        .collections
                        .get(*name)
                        .map(|slot| (name.to_string(), Arc::clone(slot)))
                        .ok_or_else(|| DataDbError::CollectionNotFound(name.to_string()))
                })
                .collect::<Result<Vec<_>>>()?
        };

        let guards = match mode {
            TransactionMode::ReadOnly => {
                let mut guards = BTreeMap::new();
                for (name, slot) in slots {
                    guards.insert(name, slot.read_owned().await);
                }
                Guards::Read(guards)
            }
            TransactionMode::ReadWrite => {
                let mut guards = BTreeMap::new();
                for (name, slot) in slots {
                    guards.insert(name, slot.write_owned().await);
                }
                Guards::Write(guards)
            }
        };

        Ok(LocalTransaction {
            shared: Arc::clone(self),
            guards,
            undo: Vec::new(),
            writes: Vec::new(),
        })
    }

    /// Durably log an operation. A no-op for in-memory databases.
    async fn append(&self, operation: WalOperation) -> Result<()> {
        if let Some(persistence) = &self.persistence {
            let wal = Arc::clone(&persistence.wal);
            tokio::task::spawn_blocking(move || wal.append(operation)).await??;
        }
        Ok(())
    }

    fn needs_checkpoint(&self) -> bool {
        self.persistence
            .as_ref()
            .map_or(false, |p| p.checkpoint_every > 0 && p.wal.len() >= p.checkpoint_every)
    }

    /// Write a snapshot of every collection and clear the log.
    async fn checkpoint(&self) -> Result<()> {
        let persistence = match &self.persistence {
            Some(p) => p,
            None => return Ok(()),
        };

        let _upgrading = self.upgrade_lock.lock().await;
        let (version, slots) = {
            let catalog = self.catalog.read();
            (catalog.version, catalog.collections.clone())
        };

        let mut guards = Vec::with_capacity(slots.len());
        for (name, slot) in slots {
            guards.push((name, slot.read_owned().await));
        }
        let image = DatabaseImage {
            version,
            collections: guards
                .iter()
                .map(|(name, guard)| (name.clone(), guard.to_image()))
                .collect(),
        };

        let dir = persistence.dir.clone();
        let wal = Arc::clone(&persistence.wal);
        let entries = wal.len();
        tokio::task::spawn_blocking(move || {
            write_snapshot(&dir, &image)?;
            wal.clear()
        })
        .await??;

        tracing::info!(db = %self.name, version, entries, "checkpoint written");
        Ok(())
    }
}

/// Apply one logged operation while loading. Upgrades already covered by the
/// snapshot are skipped, and commits carry absolute values, so replaying a
/// log on top of a snapshot that already contains it is harmless.
fn replay(
    version: &mut u32,
    collections: &mut BTreeMap<String, CollectionData>,
    operation: WalOperation,
) -> Result<()> {
    match operation {
        WalOperation::Upgrade {
            new_version, steps, ..
        } => {
            if new_version <= *version {
                return Ok(());
            }
            for step in &steps {
                apply_step(collections, step)?;
            }
            *version = new_version;
        }
        WalOperation::Commit {
            writes,
            key_generators,
        } => {
            for write in writes {
                match write {
                    WriteOp::Put {
                        collection,
                        key,
                        record,
                    } => replay_target(collections, &collection)?.restore(&key, Some(record)),
                    WriteOp::Delete { collection, key } => {
                        replay_target(collections, &collection)?.remove(&key);
                    }
                }
            }
            for (collection, next_key) in key_generators {
                replay_target(collections, &collection)?.set_next_key(next_key);
            }
        }
    }
    Ok(())
}

fn replay_target<'a>(
    collections: &'a mut BTreeMap<String, CollectionData>,
    name: &str,
) -> Result<&'a mut CollectionData> {
    collections
        .get_mut(name)
        .ok_or_else(|| DataDbError::Corruption(format!("log references unknown collection {}", name)))
}

fn apply_step(collections: &mut BTreeMap<String, CollectionData>, step: &MigrationStep) -> Result<()> {
    match step {
        MigrationStep::CreateCollection { name, options } => {
            if collections.contains_key(name) {
                return Err(DataDbError::CollectionExists(name.clone()));
            }
            if let Some(key_path) = &options.key_path {
                if !key_path.is_valid() || (key_path.is_compound() && options.auto_increment) {
                    return Err(DataDbError::InvalidSchema(format!(
                        "{}: unusable key path {}",
                        name, key_path
                    )));
                }
            }
            collections.insert(name.clone(), CollectionData::new(name.clone(), options.clone()));
            Ok(())
        }
        MigrationStep::CreateIndex { collection, index } => {
            step_target(collections, collection)?.create_index(index.clone())
        }
        MigrationStep::DeleteIndex { collection, index } => {
            step_target(collections, collection)?.delete_index(index)
        }
    }
}

fn step_target<'a>(
    collections: &'a mut BTreeMap<String, CollectionData>,
    name: &str,
) -> Result<&'a mut CollectionData> {
    collections
        .get_mut(name)
        .ok_or_else(|| DataDbError::CollectionNotFound(name.to_string()))
}

/// Upgrade transaction working on a copy of every collection.
struct LocalUpgrade {
    old_version: u32,
    new_version: u32,
    working: BTreeMap<String, CollectionData>,
    steps: Vec<MigrationStep>,
}

impl LocalUpgrade {
    fn run(&mut self, step: MigrationStep) -> Result<()> {
        apply_step(&mut self.working, &step)?;
        self.steps.push(step);
        Ok(())
    }
}

impl UpgradeTransaction for LocalUpgrade {
    fn old_version(&self) -> u32 {
        self.old_version
    }

    fn new_version(&self) -> u32 {
        self.new_version
    }

    fn collection_names(&self) -> Vec<String> {
        self.working.keys().cloned().collect()
    }

    fn create_collection(&mut self, name: &str, options: &CollectionOptions) -> Result<()> {
        self.run(MigrationStep::CreateCollection {
            name: name.to_string(),
            options: options.clone(),
        })
    }

    fn index_names(&self, collection: &str) -> Result<Vec<String>> {
        self.working
            .get(collection)
            .map(CollectionData::index_names)
            .ok_or_else(|| DataDbError::CollectionNotFound(collection.to_string()))
    }

    fn create_index(&mut self, collection: &str, index: &IndexSpec) -> Result<()> {
        self.run(MigrationStep::CreateIndex {
            collection: collection.to_string(),
            index: index.clone(),
        })
    }

    fn delete_index(&mut self, collection: &str, index: &str) -> Result<()> {
        self.run(MigrationStep::DeleteIndex {
            collection: collection.to_string(),
            index: index.to_string(),
        })
    }
}

/// A handle to an opened database.
#[derive(Clone)]
pub struct LocalDatabase {
    shared: Arc<DatabaseShared>,
    version: u32,
}

impl LocalDatabase {
    /// Snapshot the database and clear its log. A no-op in memory.
    pub async fn checkpoint(&self) -> Result<()> {
        self.shared.checkpoint().await
    }
}

#[async_trait]
impl Database for LocalDatabase {
    type Transaction = LocalTransaction;

    fn name(&self) -> &str {
        &self.shared.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn collection_names(&self) -> Vec<String> {
        self.shared.collection_names()
    }

    async fn transaction(&self, scope: &[&str], mode: TransactionMode) -> Result<LocalTransaction> {
        self.shared.begin(scope, mode).await
    }
}

enum Guards {
    Read(BTreeMap<String, OwnedRwLockReadGuard<CollectionData>>),
    Write(BTreeMap<String, OwnedRwLockWriteGuard<CollectionData>>),
}

enum Undo {
    Record {
        collection: String,
        key: Key,
        previous: Option<Record>,
    },
    KeyGenerator {
        collection: String,
        next_key: u64,
    },
}

/// A transaction over the local engine.
///
/// Writes are applied in place while the collection is held exclusively and
/// undone if the transaction is dropped without a successful commit.
pub struct LocalTransaction {
    shared: Arc<DatabaseShared>,
    guards: Guards,
    undo: Vec<Undo>,
    writes: Vec<WriteOp>,
}

impl LocalTransaction {
    fn data(&self, collection: &str) -> Result<&CollectionData> {
        let data = match &self.guards {
            Guards::Read(guards) => guards.get(collection).map(|g| &**g),
            Guards::Write(guards) => guards.get(collection).map(|g| &**g),
        };
        data.ok_or_else(|| DataDbError::NotInScope(collection.to_string()))
    }

    fn data_mut(&mut self, collection: &str) -> Result<&mut CollectionData> {
        match &mut self.guards {
            Guards::Read(_) => Err(DataDbError::ReadOnly),
            Guards::Write(guards) => guards
                .get_mut(collection)
                .map(|g| &mut **g)
                .ok_or_else(|| DataDbError::NotInScope(collection.to_string())),
        }
    }

    fn store(&mut self, collection: &str, record: Record, key: Option<Key>, overwrite: bool) -> Result<Key> {
        let stored = self.data_mut(collection)?.store(record, key, overwrite)?;
        let next_key = self.data(collection)?.next_key();

        if stored.previous_next_key != next_key {
            self.undo.push(Undo::KeyGenerator {
                collection: collection.to_string(),
                next_key: stored.previous_next_key,
            });
        }
        self.undo.push(Undo::Record {
            collection: collection.to_string(),
            key: stored.key.clone(),
            previous: stored.previous,
        });
        self.writes.push(WriteOp::Put {
            collection: collection.to_string(),
            key: stored.key.clone(),
            record: stored.record,
        });

        tracing::debug!(db = %self.shared.name, collection, key = %stored.key, "stored record");
        Ok(stored.key)
    }

    fn rollback(&mut self) {
        if let Guards::Write(guards) = &mut self.guards {
            while let Some(undo) = self.undo.pop() {
                match undo {
                    Undo::Record {
                        collection,
                        key,
                        previous,
                    } => {
                        if let Some(guard) = guards.get_mut(&collection) {
                            guard.restore(&key, previous);
                        }
                    }
                    Undo::KeyGenerator {
                        collection,
                        next_key,
                    } => {
                        if let Some(guard) = guards.get_mut(&collection) {
                            guard.set_next_key(next_key);
                        }
                    }
                }
            }
        }
        self.writes.clear();
    }
}

impl Drop for LocalTransaction {
    fn drop(&mut self) {
        if !self.undo.is_empty() {
            tracing::warn!(
                db = %self.shared.name,
                writes = self.writes.len(),
                "rolling back uncommitted transaction"
            );
            self.rollback();
        }
    }
}

#[async_trait]
impl Transaction for LocalTransaction {
    fn mode(&self) -> TransactionMode {
        match self.guards {
            Guards::Read(_) => TransactionMode::ReadOnly,
            Guards::Write(_) => TransactionMode::ReadWrite,
        }
    }

    fn key_path(&self, collection: &str) -> Result<Option<KeyPath>> {
        Ok(self.data(collection)?.options().key_path.clone())
    }

    fn get(&self, collection: &str, key: &Key) -> Result<Option<Record>> {
        Ok(self.data(collection)?.get(key).cloned())
    }

    fn get_by_index(&self, collection: &str, index: &str, value: &Key) -> Result<Option<Record>> {
        Ok(self.data(collection)?.get_by_index(index, value)?.cloned())
    }

    fn get_all(&self, collection: &str, range: Option<&KeyRange>) -> Result<Vec<Record>> {
        Ok(self.data(collection)?.get_all(range))
    }

    fn add(&mut self, collection: &str, record: Record, key: Option<Key>) -> Result<Key> {
        self.store(collection, record, key, false)
    }

    fn put(&mut self, collection: &str, record: Record, key: Option<Key>) -> Result<Key> {
        self.store(collection, record, key, true)
    }

    fn delete(&mut self, collection: &str, key: &Key) -> Result<()> {
        if let Some(previous) = self.data_mut(collection)?.remove(key) {
            self.undo.push(Undo::Record {
                collection: collection.to_string(),
                key: key.clone(),
                previous: Some(previous),
            });
            self.writes.push(WriteOp::Delete {
                collection: collection.to_string(),
                key: key.clone(),
            });
            tracing::debug!(db = %self.shared.name, collection, key = %key, "deleted record");
        }
        Ok(())
    }

    async fn commit(mut self) -> Result<()> {
        if self.writes.is_empty() {
            return Ok(());
        }

        let touched: BTreeSet<&str> = self
            .writes
            .iter()
            .map(|w| match w {
                WriteOp::Put { collection, .. } | WriteOp::Delete { collection, .. } => {
                    collection.as_str()
                }
            })
            .collect();
        let key_generators = touched
            .into_iter()
            .map(|name| Ok((name.to_string(), self.data(name)?.next_key())))
            .collect::<Result<Vec<_>>>()?;

        let operation = WalOperation::Commit {
            writes: self.writes.clone(),
            key_generators,
        };
        if let Err(e) = self.shared.append(operation).await {
            tracing::warn!(db = %self.shared.name, error = %e, "commit failed");
            self.rollback();
            return Err(e);
        }

        self.undo.clear();
        self.writes.clear();

        // Release collection locks before a checkpoint takes them all.
        let shared = Arc::clone(&self.shared);
        drop(self);
        if shared.needs_checkpoint() {
            if let Err(e) = shared.checkpoint().await {
                tracing::warn!(db = %shared.name, error = %e, "checkpoint failed");
            }
        }
        Ok(())
    }
}

fn write_manifest(dir: &Path) -> Result<()> {
    let mut file = File::create(dir.join(MANIFEST_FILE))?;
    file.write_all(MANIFEST_MAGIC)?;
    file.write_all(&[MANIFEST_VERSION])?;
    file.sync_all()?;
    Ok(())
}

fn verify_manifest(dir: &Path) -> Result<()> {
    let mut file = File::open(dir.join(MANIFEST_FILE))?;

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != MANIFEST_MAGIC {
        return Err(DataDbError::InvalidFormat("Invalid database magic".into()));
    }

    let mut version = [0u8; 1];
    file.read_exact(&mut version)?;
    if version[0] != MANIFEST_VERSION {
        return Err(DataDbError::InvalidFormat(format!(
            "Unsupported database version: {}",
            version[0]
        )));
    }
    Ok(())
}

fn acquire_lock(dir: &Path) -> Result<File> {
    let lock_file = File::create(dir.join(LOCK_FILE))?;
    lock_file
        .try_lock_exclusive()
        .map_err(|_| DataDbError::Locked)?;
    Ok(lock_file)
}

fn write_snapshot(dir: &Path, image: &DatabaseImage) -> Result<()> {
    let encoded = rmp_serde::to_vec_named(image)?;

    let tmp_path = dir.join("snapshot.tmp");
    let mut file = File::create(&tmp_path)?;
    file.write_all(SNAPSHOT_MAGIC)?;
    file.write_all(&[SNAPSHOT_VERSION])?;
    file.write_all(&(encoded.len() as u64).to_le_bytes())?;
    file.write_all(&encoded)?;
    file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
    file.sync_all()?;

    fs::rename(tmp_path, dir.join(SNAPSHOT_FILE))?;
    Ok(())
}

fn read_snapshot(dir: &Path) -> Result<DatabaseImage> {
    let path = dir.join(SNAPSHOT_FILE);
    if !path.exists() {
        return Ok(DatabaseImage::default());
    }

    let mut file = File::open(path)?;

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != SNAPSHOT_MAGIC {
        return Err(DataDbError::InvalidFormat("Invalid snapshot magic".into()));
    }

    let mut version = [0u8; 1];
    file.read_exact(&mut version)?;
    if version[0] != SNAPSHOT_VERSION {
        return Err(DataDbError::InvalidFormat(format!(
            "Unsupported snapshot version: {}",
            version[0]
        )));
    }

    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)?;
    let len = u64::from_le_bytes(len_bytes) as usize;

    let mut encoded = vec![0u8; len];
    file.read_exact(&mut encoded)?;

    let mut checksum_bytes = [0u8; 4];
    file.read_exact(&mut checksum_bytes)?;
    let expected = u32::from_le_bytes(checksum_bytes);
    let got = crc32fast::hash(&encoded);
    if expected != got {
        return Err(DataDbError::Corruption(format!(
            "snapshot checksum mismatch: expected {}, got {}",
            expected, got
        )));
    }

    Ok(rmp_serde::from_slice(&encoded)?)
}
