// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

use std::collections::HashMap;
use std::sync::Arc;

use chrono::prelude::*;
use serde::{Deserialize, Serialize};
use vellum_core::datatypes::Schema;
use vellum_core::Result;

use super::{FileVersion, Fragment, IndexMetadata};
use crate::feature_flags::FLAG_STABLE_ROW_IDS;

/// Versions with this bit set live outside the main lineage.
pub const DETACHED_VERSION_MASK: u64 = 0x8000_0000_0000_0000;

pub fn is_detached_version(version: u64) -> bool {
    version & DETACHED_VERSION_MASK != 0
}

/// Manifest of a dataset
///
///  * Schema
///  * Version
///  * Fragments.
///  * Indices.
///  * Config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Dataset schema.
    pub schema: Schema,

    /// Dataset version
    pub version: u64,

    /// Version of the writer library that wrote this manifest.
    pub writer_version: Option<WriterVersion>,

    /// Fragments, the pieces to build the dataset.
    pub fragments: Arc<Vec<Fragment>>,

    /// Indices over the fragments of this version.
    #[serde(default)]
    pub indices: Vec<IndexMetadata>,

    /// The creation timestamp with nanosecond resolution as 128-bit integer
    pub timestamp_nanos: u128,

    /// An optional string tag for this version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    /// The reader flags
    pub reader_feature_flags: u64,

    /// The writer flags
    pub writer_feature_flags: u64,

    /// The max fragment id used so far.
    /// None means never set, Some(0) means the max id used so far is 0.
    pub max_fragment_id: Option<u32>,

    /// The path to the transaction file, relative to the root of the dataset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_file: Option<String>,

    /// Uuid of the transaction that produced this version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_uuid: Option<String>,

    /// Caller supplied properties of the transaction that produced this version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_properties: Option<HashMap<String, String>>,

    /// The next unused row id. If zero, then the table does not have any rows.
    ///
    /// This is only used if the "stable_row_ids" feature flag is set.
    pub next_row_id: u64,

    /// The storage format of the data files.
    pub data_storage_format: DataStorageFormat,

    /// Table configuration.
    #[serde(default)]
    pub config: HashMap<String, String>,
}

impl Manifest {
    pub fn new(
        schema: Schema,
        fragments: Arc<Vec<Fragment>>,
        data_storage_format: DataStorageFormat,
    ) -> Self {
        Self {
            schema,
            version: 1,
            writer_version: Some(WriterVersion::default()),
            fragments,
            indices: vec![],
            timestamp_nanos: 0,
            tag: None,
            reader_feature_flags: 0,
            writer_feature_flags: 0,
            max_fragment_id: None,
            transaction_file: None,
            transaction_uuid: None,
            transaction_properties: None,
            next_row_id: 0,
            data_storage_format,
            config: HashMap::new(),
        }
    }

    pub fn new_from_previous(
        previous: &Self,
        schema: Schema,
        fragments: Arc<Vec<Fragment>>,
    ) -> Self {
        Self {
            schema,
            version: previous.version + 1,
            writer_version: Some(WriterVersion::default()),
            fragments,
            indices: vec![], // Caller should carry over the indices they want to keep.
            timestamp_nanos: 0, // This will be set on commit
            tag: None,
            reader_feature_flags: 0, // These will be set on commit
            writer_feature_flags: 0, // These will be set on commit
            max_fragment_id: previous.max_fragment_id,
            transaction_file: None,
            transaction_uuid: None,
            transaction_properties: None,
            next_row_id: previous.next_row_id,
            data_storage_format: previous.data_storage_format.clone(),
            config: previous.config.clone(),
        }
    }

    /// The manifest of a dataset that does not exist yet.
    ///
    /// Its version is 0 so the first committed manifest is version 1.
    pub fn empty(data_storage_format: DataStorageFormat) -> Self {
        let mut manifest = Self::new(Schema::default(), Arc::new(vec![]), data_storage_format);
        manifest.version = 0;
        manifest
    }

    /// Return the `timestamp_nanos` value as a Utc DateTime
    pub fn timestamp(&self) -> DateTime<Utc> {
        let nanos = self.timestamp_nanos % 1_000_000_000;
        let seconds = ((self.timestamp_nanos - nanos) / 1_000_000_000) as i64;
        Utc.from_utc_datetime(
            &DateTime::from_timestamp(seconds, nanos as u32)
                .unwrap_or_default()
                .naive_utc(),
        )
    }

    /// Set the `timestamp_nanos` value from a Utc DateTime
    pub fn set_timestamp(&mut self, nanos: u128) {
        self.timestamp_nanos = nanos;
    }

    /// Check the current fragment list and update the high water mark
    pub fn update_max_fragment_id(&mut self) {
        // If there are no fragments, we don't need to update the max fragment id.
        if self.fragments.is_empty() {
            return;
        }

        let max_fragment_id = self
            .fragments
            .iter()
            .map(|f| f.id)
            .max()
            .unwrap_or_default() as u32;

        match self.max_fragment_id {
            None => self.max_fragment_id = Some(max_fragment_id),
            Some(current) if max_fragment_id > current => {
                self.max_fragment_id = Some(max_fragment_id)
            }
            _ => {}
        }
    }

    /// Return the max fragment id.
    /// Note this does not support recycling of fragment ids.
    ///
    /// This will return None if there are no fragments and none were ever reserved.
    pub fn max_fragment_id(&self) -> Option<u64> {
        match self.max_fragment_id {
            Some(id) => Some(id.into()),
            None => self.fragments.iter().map(|f| f.id).max(),
        }
    }

    /// Whether rows of this dataset keep their ids across moves.
    pub fn uses_stable_row_ids(&self) -> bool {
        self.reader_feature_flags & FLAG_STABLE_ROW_IDS != 0
    }

    /// Total number of rows, when every fragment knows its own row count.
    pub fn count_rows(&self) -> Option<usize> {
        self.fragments.iter().map(|f| f.num_rows()).sum()
    }

    /// Set (insert or overwrite) the config values.
    pub fn update_config(&mut self, upsert_values: impl IntoIterator<Item = (String, String)>) {
        self.config.extend(upsert_values);
    }

    /// Delete `keys` from the config.
    pub fn delete_config_keys(&mut self, delete_keys: &[&str]) {
        self.config.retain(|key, _| !delete_keys.contains(&key.as_str()));
    }

    pub fn is_detached(&self) -> bool {
        is_detached_version(self.version)
    }

}

/// The file format and version the data files of a dataset are written with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStorageFormat {
    pub file_format: String,
    pub version: String,
}

const VELLUM_FORMAT_NAME: &str = "vellum";

impl DataStorageFormat {
    pub fn new(version: FileVersion) -> Self {
        Self {
            file_format: VELLUM_FORMAT_NAME.to_string(),
            version: version.resolve().to_string(),
        }
    }

    pub fn file_version(&self) -> Result<FileVersion> {
        self.version.parse::<FileVersion>()
    }
}

impl Default for DataStorageFormat {
    fn default() -> Self {
        Self::new(FileVersion::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterVersion {
    pub library: String,
    pub version: String,
}

impl Default for WriterVersion {
    fn default() -> Self {
        Self {
            library: VELLUM_FORMAT_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_core::datatypes::Field;

    fn fragments(ids: &[u64]) -> Arc<Vec<Fragment>> {
        Arc::new(
            ids.iter()
                .map(|id| {
                    let mut frag = Fragment::new(*id);
                    frag.physical_rows = Some(10);
                    frag
                })
                .collect(),
        )
    }

    #[test]
    fn test_writer_version() {
        let wv = WriterVersion::default();
        assert_eq!(wv.library, "vellum");
        assert_eq!(wv.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_timestamp() {
        let mut manifest = Manifest::empty(DataStorageFormat::default());
        manifest.set_timestamp(1_700_000_000_123_456_789);
        let ts = manifest.timestamp();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_nanos(), 123_456_789);
    }

    #[test]
    fn test_max_fragment_id() {
        let schema = Schema::new(vec![Field::new("a", "int64", true)]);
        let mut manifest = Manifest::new(schema.clone(), fragments(&[]), Default::default());
        assert_eq!(manifest.max_fragment_id(), None);
        manifest.update_max_fragment_id();
        assert_eq!(manifest.max_fragment_id, None);

        let mut next =
            Manifest::new_from_previous(&manifest, schema.clone(), fragments(&[0, 3]));
        assert_eq!(next.version, 2);
        assert_eq!(next.max_fragment_id(), Some(3));
        next.update_max_fragment_id();
        assert_eq!(next.max_fragment_id, Some(3));

        // Removing fragments never lowers the high water mark.
        let after = Manifest::new_from_previous(&next, schema, fragments(&[0]));
        assert_eq!(after.max_fragment_id(), Some(3));
        assert_eq!(next.count_rows(), Some(20));
    }

    #[test]
    fn test_config() {
        let mut manifest = Manifest::empty(DataStorageFormat::default());
        manifest.update_config([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);
        manifest.update_config([("a".to_string(), "3".to_string())]);
        manifest.delete_config_keys(&["b"]);
        assert_eq!(
            manifest.config,
            HashMap::from([("a".to_string(), "3".to_string())])
        );

        let next = Manifest::new_from_previous(&manifest, Schema::default(), fragments(&[]));
        assert_eq!(next.config, manifest.config);
    }

    #[test]
    fn test_detached_version() {
        assert!(!is_detached_version(1));
        assert!(is_detached_version(DETACHED_VERSION_MASK | 12));
    }

    #[test]
    fn test_data_storage_format() {
        let format = DataStorageFormat::new(FileVersion::Stable);
        assert_eq!(format.version, "2.0");
        assert_eq!(format.file_version().unwrap(), FileVersion::V2_0);
        assert_eq!(format.file_format, "vellum");
    }
}
