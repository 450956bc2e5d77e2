//! Declarative collection and index specifications.

use crate::error::{DataDbError, Result};
use crate::types::KeyPath;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Options fixed when a collection is created.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionOptions {
    /// Inline key location. `None` means keys are supplied out of line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<KeyPath>,

    /// Whether the collection generates keys.
    #[serde(default)]
    pub auto_increment: bool,
}

impl CollectionOptions {
    /// Keys live inside the record.
    pub fn is_inline(&self) -> bool {
        self.key_path.is_some()
    }
}

/// A secondary index declaration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "IndexSpecRepr")]
#[serde(rename_all = "camelCase")]
pub struct IndexSpec {
    pub name: String,
    /// Defaults to the index name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<KeyPath>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub multi_entry: bool,
}

/// Indexes may be written as a bare name or as a full object.
#[derive(Deserialize)]
#[serde(untagged)]
enum IndexSpecRepr {
    Name(String),
    #[serde(rename_all = "camelCase")]
    Full {
        name: String,
        #[serde(default)]
        key_path: Option<KeyPath>,
        #[serde(default)]
        unique: bool,
        #[serde(default)]
        multi_entry: bool,
    },
}

impl From<IndexSpecRepr> for IndexSpec {
    fn from(repr: IndexSpecRepr) -> Self {
        match repr {
            IndexSpecRepr::Name(name) => IndexSpec::new(name),
            IndexSpecRepr::Full {
                name,
                key_path,
                unique,
                multi_entry,
            } => IndexSpec {
                name,
                key_path,
                unique,
                multi_entry,
            },
        }
    }
}

impl IndexSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_path: None,
            unique: false,
            multi_entry: false,
        }
    }

    pub fn with_key_path(mut self, key_path: impl Into<KeyPath>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn multi_entry(mut self) -> Self {
        self.multi_entry = true;
        self
    }

    /// The effective key path: the declared one, or the index name.
    pub fn key_path(&self) -> KeyPath {
        self.key_path
            .clone()
            .unwrap_or_else(|| KeyPath::Single(self.name.clone()))
    }
}

/// A collection declaration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub name: String,
    #[serde(default)]
    pub options: CollectionOptions,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
}

impl CollectionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: CollectionOptions::default(),
            indexes: Vec::new(),
        }
    }

    pub fn key_path(mut self, key_path: impl Into<KeyPath>) -> Self {
        self.options.key_path = Some(key_path.into());
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.options.auto_increment = true;
        self
    }

    pub fn index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn index_names(&self) -> impl Iterator<Item = &str> {
        self.indexes.iter().map(|i| i.name.as_str())
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(DataDbError::InvalidSchema("empty collection name".into()));
        }
        if let Some(key_path) = &self.options.key_path {
            if !key_path.is_valid() {
                return Err(DataDbError::InvalidSchema(format!(
                    "{}: invalid key path {}",
                    self.name, key_path
                )));
            }
            if key_path.is_compound() && self.options.auto_increment {
                return Err(DataDbError::InvalidSchema(format!(
                    "{}: auto increment needs a single key path",
                    self.name
                )));
            }
        }

        let mut seen = HashSet::new();
        for index in &self.indexes {
            if index.name.is_empty() {
                return Err(DataDbError::InvalidSchema(format!(
                    "{}: empty index name",
                    self.name
                )));
            }
            if !seen.insert(index.name.as_str()) {
                return Err(DataDbError::InvalidSchema(format!(
                    "{}: duplicate index {}",
                    self.name, index.name
                )));
            }
            let key_path = index.key_path();
            if !key_path.is_valid() {
                return Err(DataDbError::InvalidSchema(format!(
                    "{}.{}: invalid key path {}",
                    self.name, index.name, key_path
                )));
            }
            if key_path.is_compound() && index.multi_entry {
                return Err(DataDbError::InvalidSchema(format!(
                    "{}.{}: multi-entry index needs a single key path",
                    self.name, index.name
                )));
            }
        }
        Ok(())
    }
}

/// The full set of collections for one database version.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<CollectionSpec>", into = "Vec<CollectionSpec>")]
pub struct Schema {
    collections: Vec<CollectionSpec>,
}

impl Schema {
    /// Build a validated schema.
    pub fn new(collections: Vec<CollectionSpec>) -> Result<Self> {
        let mut seen = HashSet::new();
        for collection in &collections {
            collection.validate()?;
            if !seen.insert(collection.name.as_str()) {
                return Err(DataDbError::InvalidSchema(format!(
                    "duplicate collection {}",
                    collection.name
                )));
            }
        }
        Ok(Self { collections })
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionSpec> {
        self.collections.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.collection(name).is_some()
    }

    pub fn collections(&self) -> &[CollectionSpec] {
        &self.collections
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

impl TryFrom<Vec<CollectionSpec>> for Schema {
    type Error = DataDbError;

    fn try_from(collections: Vec<CollectionSpec>) -> Result<Self> {
        Schema::new(collections)
    }
}

impl From<Schema> for Vec<CollectionSpec> {
    fn from(schema: Schema) -> Self {
        schema.collections
    }
}

/// A schema tagged with the database version it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedSchema {
    pub version: u32,
    pub schema: Schema,
}

/// Every schema the application has shipped, one per version.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<VersionedSchema>", into = "Vec<VersionedSchema>")]
pub struct SchemaHistory {
    versions: Vec<VersionedSchema>,
}

impl SchemaHistory {
    pub fn new(versions: Vec<VersionedSchema>) -> Result<Self> {
        let mut seen = HashSet::new();
        for entry in &versions {
            if entry.version == 0 {
                return Err(DataDbError::InvalidVersion(0));
            }
            if !seen.insert(entry.version) {
                return Err(DataDbError::InvalidSchema(format!(
                    "version {} declared twice",
                    entry.version
                )));
            }
        }
        Ok(Self { versions })
    }

    /// Parse a history from JSON.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| DataDbError::InvalidSchema(e.to_string()))
    }

    /// Load a history from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// The schema declared for exactly this version.
    pub fn find(&self, version: u32) -> Option<&Schema> {
        self.versions
            .iter()
            .find(|v| v.version == version)
            .map(|v| &v.schema)
    }
}

impl TryFrom<Vec<VersionedSchema>> for SchemaHistory {
    type Error = DataDbError;

    fn try_from(versions: Vec<VersionedSchema>) -> Result<Self> {
        SchemaHistory::new(versions)
    }
}

impl From<SchemaHistory> for Vec<VersionedSchema> {
    fn from(history: SchemaHistory) -> Self {
        history.versions
    }
}
