//! In-memory collection with secondary index maintenance.

use crate::error::{DataDbError, Result};
use crate::schema::{CollectionOptions, IndexSpec};
use crate::types::{resolve, Key, KeyPath, KeyRange, Record, MAX_GENERATED_KEY};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// A secondary index: index key -> primary keys.
#[derive(Clone, Debug)]
struct IndexData {
    spec: IndexSpec,
    key_path: KeyPath,
    entries: BTreeMap<Key, BTreeSet<Key>>,
}

impl IndexData {
    fn new(spec: IndexSpec) -> Self {
        Self {
            key_path: spec.key_path(),
            spec,
            entries: BTreeMap::new(),
        }
    }

    /// Index keys a record contributes. Multi-entry indexes contribute each
    /// valid array element once.
    fn keys_for(&self, record: &Record) -> Vec<Key> {
        if self.spec.multi_entry {
            if let KeyPath::Single(path) = &self.key_path {
                if let Some(Value::Array(items)) = resolve(record, path) {
                    let keys: BTreeSet<Key> = items.iter().filter_map(Key::from_value).collect();
                    return keys.into_iter().collect();
                }
            }
        }
        self.key_path.evaluate(record).into_iter().collect()
    }

    fn conflicts(&self, index_key: &Key, primary: &Key) -> bool {
        self.spec.unique
            && self
                .entries
                .get(index_key)
                .map_or(false, |owners| owners.iter().any(|owner| owner != primary))
    }

    fn insert(&mut self, record: &Record, primary: &Key) {
        for index_key in self.keys_for(record) {
            self.entries
                .entry(index_key)
                .or_default()
                .insert(primary.clone());
        }
    }

    fn remove(&mut self, record: &Record, primary: &Key) {
        for index_key in self.keys_for(record) {
            if let Some(owners) = self.entries.get_mut(&index_key) {
                owners.remove(primary);
                if owners.is_empty() {
                    self.entries.remove(&index_key);
                }
            }
        }
    }
}

/// Outcome of a successful write, enough to undo it.
#[derive(Debug)]
pub(crate) struct Stored {
    pub key: Key,
    pub record: Record,
    pub previous: Option<Record>,
    pub previous_next_key: u64,
}

/// Persisted form of a collection. Index entries are rebuilt on load.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct CollectionImage {
    pub options: CollectionOptions,
    pub indexes: Vec<IndexSpec>,
    pub records: Vec<(Key, Record)>,
    pub next_key: u64,
}

/// A named set of records ordered by primary key.
#[derive(Clone, Debug)]
pub(crate) struct CollectionData {
    name: String,
    options: CollectionOptions,
    records: BTreeMap<Key, Record>,
    indexes: BTreeMap<String, IndexData>,
    next_key: u64,
}

impl CollectionData {
    pub fn new(name: impl Into<String>, options: CollectionOptions) -> Self {
        Self {
            name: name.into(),
            options,
            records: BTreeMap::new(),
            indexes: BTreeMap::new(),
            next_key: 1,
        }
    }

    pub fn options(&self) -> &CollectionOptions {
        &self.options
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn next_key(&self) -> u64 {
        self.next_key
    }

    pub fn set_next_key(&mut self, next_key: u64) {
        self.next_key = next_key;
    }

    // --- Reads ---

    pub fn get(&self, key: &Key) -> Option<&Record> {
        self.records.get(key)
    }

    pub fn get_by_index(&self, index: &str, value: &Key) -> Result<Option<&Record>> {
        let index = self.index(index)?;
        Ok(index
            .entries
            .get(value)
            .and_then(|owners| owners.iter().next())
            .and_then(|primary| self.records.get(primary)))
    }

    pub fn get_all(&self, range: Option<&KeyRange>) -> Vec<Record> {
        match range {
            Some(range) => self
                .records
                .range::<Key, _>(range.as_bounds())
                .map(|(_, record)| record.clone())
                .collect(),
            None => self.records.values().cloned().collect(),
        }
    }

    // --- Writes ---

    /// Insert a record, or replace it when `overwrite` is set.
    ///
    /// Nothing is modified when an error is returned.
    pub fn store(&mut self, mut record: Record, explicit: Option<Key>, overwrite: bool) -> Result<Stored> {
        let previous_next_key = self.next_key;
        let mut next_key = self.next_key;

        let key = match (self.options.key_path.clone(), explicit) {
            (Some(_), Some(_)) => {
                return Err(DataDbError::Data(format!(
                    "{} uses inline keys; an explicit key is not allowed",
                    self.name
                )))
            }
            (Some(path), None) => match path.evaluate(&record) {
                Some(key) => key,
                None => {
                    if let KeyPath::Single(p) = &path {
                        if resolve(&record, p).is_some() {
                            return Err(DataDbError::Data(format!(
                                "value at key path {} is not a valid key",
                                path
                            )));
                        }
                    }
                    if !self.options.auto_increment {
                        return Err(DataDbError::Data(format!(
                            "record has no value at key path {}",
                            path
                        )));
                    }
                    let key = generate(&self.name, &mut next_key)?;
                    path.inject(&mut record, &key)?;
                    key
                }
            },
            (None, Some(key)) => {
                key.validate()?;
                key
            }
            (None, None) if self.options.auto_increment => generate(&self.name, &mut next_key)?,
            (None, None) => {
                return Err(DataDbError::Data(format!(
                    "{} uses out-of-line keys; a key is required",
                    self.name
                )))
            }
        };

        if self.options.auto_increment {
            if let Some(n) = key.as_number() {
                bump(&mut next_key, n);
            }
        }

        if !overwrite && self.records.contains_key(&key) {
            return Err(DataDbError::Constraint(format!(
                "key {} already exists in {}",
                key, self.name
            )));
        }

        for index in self.indexes.values().filter(|i| i.spec.unique) {
            if let Some(index_key) = index
                .keys_for(&record)
                .into_iter()
                .find(|k| index.conflicts(k, &key))
            {
                return Err(DataDbError::Constraint(format!(
                    "unique index {}.{} already holds {}",
                    self.name, index.spec.name, index_key
                )));
            }
        }

        let previous = self.remove(&key);
        self.insert(key.clone(), record.clone());
        self.next_key = next_key;

        Ok(Stored {
            key,
            record,
            previous,
            previous_next_key,
        })
    }

    /// Remove a record and its index entries.
    pub fn remove(&mut self, key: &Key) -> Option<Record> {
        let record = self.records.remove(key)?;
        for index in self.indexes.values_mut() {
            index.remove(&record, key);
        }
        Some(record)
    }

    /// Put a record back to a known state without constraint checks.
    pub fn restore(&mut self, key: &Key, record: Option<Record>) {
        self.remove(key);
        if let Some(record) = record {
            self.insert(key.clone(), record);
        }
    }

    fn insert(&mut self, key: Key, record: Record) {
        for index in self.indexes.values_mut() {
            index.insert(&record, &key);
        }
        self.records.insert(key, record);
    }

    // --- Indexes ---

    pub fn index_names(&self) -> Vec<String> {
        self.indexes.keys().cloned().collect()
    }

    pub fn index_specs(&self) -> Vec<IndexSpec> {
        self.indexes.values().map(|i| i.spec.clone()).collect()
    }

    /// Build an index over the existing records.
    pub fn create_index(&mut self, spec: IndexSpec) -> Result<()> {
        if self.indexes.contains_key(&spec.name) {
            return Err(DataDbError::IndexExists {
                collection: self.name.clone(),
                index: spec.name,
            });
        }

        let mut index = IndexData::new(spec);
        for (primary, record) in &self.records {
            if let Some(index_key) = index
                .keys_for(record)
                .into_iter()
                .find(|k| index.conflicts(k, primary))
            {
                return Err(DataDbError::Constraint(format!(
                    "cannot build unique index {}.{}: {} is not unique",
                    self.name, index.spec.name, index_key
                )));
            }
            index.insert(record, primary);
        }

        self.indexes.insert(index.spec.name.clone(), index);
        Ok(())
    }

    pub fn delete_index(&mut self, name: &str) -> Result<()> {
        self.indexes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| DataDbError::IndexNotFound {
                collection: self.name.clone(),
                index: name.to_string(),
            })
    }

    fn index(&self, name: &str) -> Result<&IndexData> {
        self.indexes.get(name).ok_or_else(|| DataDbError::IndexNotFound {
            collection: self.name.clone(),
            index: name.to_string(),
        })
    }

    // --- Images ---

    pub fn to_image(&self) -> CollectionImage {
        CollectionImage {
            options: self.options.clone(),
            indexes: self.index_specs(),
            records: self
                .records
                .iter()
                .map(|(k, r)| (k.clone(), r.clone()))
                .collect(),
            next_key: self.next_key,
        }
    }

    pub fn from_image(name: &str, image: CollectionImage) -> Result<Self> {
        let mut data = Self::new(name, image.options);
        data.next_key = image.next_key;
        for (key, record) in image.records {
            data.records.insert(key, record);
        }
        for spec in image.indexes {
            data.create_index(spec)?;
        }
        Ok(data)
    }
}

fn generate(collection: &str, next_key: &mut u64) -> Result<Key> {
    if *next_key > MAX_GENERATED_KEY {
        return Err(DataDbError::Constraint(format!(
            "key generator for {} is exhausted",
            collection
        )));
    }
    let key = Key::from(*next_key as i64);
    *next_key += 1;
    Ok(key)
}

/// Explicit numeric keys push the generator past them.
fn bump(next_key: &mut u64, n: f64) {
    if n >= *next_key as f64 {
        let floor = n.floor();
        *next_key = if floor >= MAX_GENERATED_KEY as f64 {
            MAX_GENERATED_KEY + 1
        } else {
            floor as u64 + 1
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subtitles() -> CollectionData {
        let mut data = CollectionData::new(
            "subtitles",
            CollectionOptions {
                key_path: None,
                auto_increment: true,
            },
        );
        data.create_index(IndexSpec::new("language")).unwrap();
        data
    }

    #[test]
    fn test_generated_keys_start_at_one() {
        let mut data = subtitles();
        let first = data.store(json!({"language": "en"}), None, false).unwrap();
        let second = data.store(json!({"language": "fr"}), None, false).unwrap();
        assert_eq!(first.key, Key::from(1));
        assert_eq!(second.key, Key::from(2));
        assert_eq!(data.len(), 2);
    }

    #[test]
    fn test_explicit_key_bumps_generator() {
        let mut data = subtitles();
        data.store(json!({}), Some(Key::number(10.5).unwrap()), false)
            .unwrap();
        let next = data.store(json!({}), None, false).unwrap();
        assert_eq!(next.key, Key::from(11));

        // String keys leave the generator alone
        data.store(json!({}), Some(Key::from("x")), false).unwrap();
        assert_eq!(data.next_key(), 12);
    }

    #[test]
    fn test_explicit_key_is_validated() {
        let mut data = subtitles();
        let result = data.store(json!({}), Some(Key::Number(f64::NAN)), false);
        assert!(matches!(result, Err(DataDbError::Data(_))));
        assert_eq!(data.len(), 0);

        data.store(json!({"n": 1}), Some(Key::Number(-0.0)), false).unwrap();
        assert_eq!(data.get(&Key::from(0)), Some(&json!({"n": 1})));
    }

    #[test]
    fn test_inline_key_injected() {
        let mut data = CollectionData::new(
            "items",
            CollectionOptions {
                key_path: Some(KeyPath::single("id")),
                auto_increment: true,
            },
        );
        let stored = data.store(json!({"name": "a"}), None, false).unwrap();
        assert_eq!(stored.record, json!({"name": "a", "id": 1}));
        assert_eq!(data.get(&Key::from(1)), Some(&json!({"name": "a", "id": 1})));

        let err = data.store(json!({"id": true}), None, false).unwrap_err();
        assert!(matches!(err, DataDbError::Data(_)));
    }

    #[test]
    fn test_inline_without_generator_requires_key() {
        let mut data = CollectionData::new(
            "items",
            CollectionOptions {
                key_path: Some(KeyPath::single("id")),
                auto_increment: false,
            },
        );
        assert!(matches!(
            data.store(json!({"name": "a"}), None, false),
            Err(DataDbError::Data(_))
        ));
        assert!(matches!(
            data.store(json!({"id": 1}), Some(Key::from(1)), true),
            Err(DataDbError::Data(_))
        ));
    }

    #[test]
    fn test_add_rejects_existing_key() {
        let mut data = subtitles();
        data.store(json!({"v": 1}), Some(Key::from(5)), false).unwrap();
        let err = data
            .store(json!({"v": 2}), Some(Key::from(5)), false)
            .unwrap_err();
        assert!(matches!(err, DataDbError::Constraint(_)));
        assert_eq!(data.get(&Key::from(5)), Some(&json!({"v": 1})));
        assert_eq!(data.next_key(), 6);
    }

    #[test]
    fn test_index_lookup_follows_replacement() {
        let mut data = subtitles();
        data.store(json!({"language": "en"}), Some(Key::from(1)), true)
            .unwrap();
        data.store(json!({"language": "de"}), Some(Key::from(1)), true)
            .unwrap();

        assert_eq!(
            data.get_by_index("language", &Key::from("en")).unwrap(),
            None
        );
        assert_eq!(
            data.get_by_index("language", &Key::from("de")).unwrap(),
            Some(&json!({"language": "de"}))
        );
    }

    #[test]
    fn test_index_lookup_returns_lowest_primary_key() {
        let mut data = subtitles();
        data.store(json!({"language": "en", "n": 2}), Some(Key::from(2)), false)
            .unwrap();
        data.store(json!({"language": "en", "n": 1}), Some(Key::from(1)), false)
            .unwrap();
        let found = data.get_by_index("language", &Key::from("en")).unwrap();
        assert_eq!(found, Some(&json!({"language": "en", "n": 1})));
    }

    #[test]
    fn test_unique_index_enforced() {
        let mut data = subtitles();
        data.create_index(IndexSpec::new("src").unique()).unwrap();
        data.store(json!({"src": "a.srt"}), None, false).unwrap();

        let err = data.store(json!({"src": "a.srt"}), None, false).unwrap_err();
        assert!(matches!(err, DataDbError::Constraint(_)));
        assert_eq!(data.len(), 1);
        // Failed writes do not consume generated keys
        assert_eq!(data.next_key(), 2);

        // Replacing the owner with the same value is fine
        data.store(json!({"src": "a.srt", "v": 2}), Some(Key::from(1)), true)
            .unwrap();
    }

    #[test]
    fn test_unique_index_build_fails_on_duplicates() {
        let mut data = subtitles();
        data.store(json!({"src": "a"}), None, false).unwrap();
        data.store(json!({"src": "a"}), None, false).unwrap();
        let err = data.create_index(IndexSpec::new("src").unique()).unwrap_err();
        assert!(matches!(err, DataDbError::Constraint(_)));
        assert!(!data.index_names().contains(&"src".to_string()));
    }

    #[test]
    fn test_multi_entry_index() {
        let mut data = subtitles();
        data.create_index(IndexSpec::new("tags").multi_entry()).unwrap();
        data.store(json!({"tags": ["a", "b", "a", null]}), None, false)
            .unwrap();
        assert!(data.get_by_index("tags", &Key::from("b")).unwrap().is_some());
        assert!(data
            .get_by_index("tags", &Key::Array(vec![Key::from("a"), Key::from("b")]))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_deleted_index_no_longer_resolves() {
        let mut data = subtitles();
        data.delete_index("language").unwrap();
        assert!(matches!(
            data.get_by_index("language", &Key::from("en")),
            Err(DataDbError::IndexNotFound { .. })
        ));
        assert!(data.delete_index("language").is_err());
    }

    #[test]
    fn test_get_all_with_range() {
        let mut data = subtitles();
        for i in 1..=5 {
            data.store(json!({ "n": i }), None, false).unwrap();
        }
        let range = KeyRange::bound(2, 4, false, true).unwrap();
        assert_eq!(data.get_all(Some(&range)), vec![json!({"n": 2}), json!({"n": 3})]);
        assert_eq!(data.get_all(None).len(), 5);
    }

    #[test]
    fn test_image_rebuilds_indexes() {
        let mut data = subtitles();
        data.store(json!({"language": "en"}), None, false).unwrap();
        let restored = CollectionData::from_image("subtitles", data.to_image()).unwrap();
        assert_eq!(restored.next_key(), 2);
        assert!(restored
            .get_by_index("language", &Key::from("en"))
            .unwrap()
            .is_some());
    }
}
