//! Databases the application ships with.
//!
//! Bump a version constant whenever the schema declared for it changes; the
//! previous schemas stay in the history.

use crate::error::Result;
use crate::schema::{CollectionSpec, IndexSpec, Schema, SchemaHistory, VersionedSchema};

pub const DATADB_NAME: &str = "data";
pub const SUBTITLE_COLLECTION: &str = "subtitles";
pub const DATADB_VERSION: u32 = 1;

pub const INFO_DATABASE_NAME: &str = "Info";
pub const RECENT_PLAYED_COLLECTION: &str = "recent-played";
pub const INFODB_VERSION: u32 = 1;

pub const THUMBNAIL_DB_NAME: &str = "splayerx-preview-thumbnails";
pub const THUMBNAIL_COLLECTION: &str = "the-preview-thumbnail";

/// Every schema of the data database.
pub fn datadb_schemas() -> Result<SchemaHistory> {
    let subtitles = ["type", "src", "format", "language", "lastOpened"]
        .into_iter()
        .fold(
            CollectionSpec::new(SUBTITLE_COLLECTION).auto_increment(),
            |spec, index| spec.index(IndexSpec::new(index)),
        );

    SchemaHistory::new(vec![VersionedSchema {
        version: 1,
        schema: Schema::new(vec![subtitles])?,
    }])
}

/// Schema of the info database at [`INFODB_VERSION`].
pub fn info_schema() -> Result<Schema> {
    let recent_played = ["lastOpened", "path", "lastPlayedTime"]
        .into_iter()
        .fold(
            CollectionSpec::new(RECENT_PLAYED_COLLECTION),
            |spec, index| spec.index(IndexSpec::new(index)),
        );

    Schema::new(vec![recent_played, CollectionSpec::new(THUMBNAIL_COLLECTION)])
}
