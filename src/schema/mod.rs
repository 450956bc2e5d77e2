//! Schema declarations and upgrade planning.
//!
//! A database version maps to exactly one [`Schema`]. When a database is
//! opened at a newer version, the declared schema is reconciled against the
//! stored catalog: missing collections are created with their indexes, and
//! index sets of existing collections are brought in line with the
//! declaration.

pub mod migration;
mod declaration;

pub use migration::{ExistingCatalog, MigrationStep};
pub use declaration::{
    CollectionOptions, CollectionSpec, IndexSpec, Schema, SchemaHistory, VersionedSchema,
};
