// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Metadata for index

use chrono::{DateTime, Utc};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Index metadata
///
/// Indices are opaque to the commit protocol. Only the fields they cover and
/// the fragments they were built over are interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Unique ID across all dataset versions.
    pub uuid: Uuid,

    /// Fields to build the index.
    pub fields: Vec<i32>,

    /// Human readable index name
    pub name: String,

    /// The latest version of the dataset this index covers
    pub dataset_version: u64,

    /// The fragment ids this index covers.
    ///
    /// This may contain fragment ids that no longer exist in the dataset.
    ///
    /// If this is None, then this is unknown.
    #[serde(default, with = "bitmap_serde")]
    pub fragment_bitmap: Option<RoaringBitmap>,

    /// The index version.
    #[serde(default)]
    pub index_version: i32,

    /// Timestamp when the index was created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl IndexMetadata {
    pub fn new(name: impl Into<String>, fields: Vec<i32>, dataset_version: u64) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            fields,
            name: name.into(),
            dataset_version,
            fragment_bitmap: None,
            index_version: 0,
            created_at: Some(Utc::now()),
        }
    }

    pub fn with_fragment_bitmap(self, fragment_ids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            fragment_bitmap: Some(fragment_ids.into_iter().collect()),
            ..self
        }
    }

    pub fn effective_fragment_bitmap(
        &self,
        existing_fragments: &RoaringBitmap,
    ) -> Option<RoaringBitmap> {
        let fragment_bitmap = self.fragment_bitmap.as_ref()?;
        Some(fragment_bitmap & existing_fragments)
    }
}

/// Fragment bitmaps are stored as a sorted list of fragment ids.
mod bitmap_serde {
    use roaring::RoaringBitmap;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        bitmap: &Option<RoaringBitmap>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        bitmap
            .as_ref()
            .map(|b| b.iter().collect::<Vec<u32>>())
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<RoaringBitmap>, D::Error> {
        let ids = Option::<Vec<u32>>::deserialize(deserializer)?;
        Ok(ids.map(RoaringBitmap::from_iter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_fragment_bitmap() {
        let index = IndexMetadata::new("idx", vec![0], 3).with_fragment_bitmap([0, 1, 2]);
        let existing = RoaringBitmap::from_iter([1, 2, 5]);
        let effective = index.effective_fragment_bitmap(&existing).unwrap();
        assert_eq!(effective.iter().collect::<Vec<_>>(), vec![1, 2]);

        let unknown = IndexMetadata::new("idx", vec![0], 3);
        assert!(unknown.effective_fragment_bitmap(&existing).is_none());
    }

    #[test]
    fn test_bitmap_json() {
        let index = IndexMetadata::new("idx", vec![0, 1], 2).with_fragment_bitmap([4, 2]);
        let json = serde_json::to_value(&index).unwrap();
        assert_eq!(json["fragment_bitmap"], serde_json::json!([2, 4]));
        let decoded: IndexMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, index);
    }
}
