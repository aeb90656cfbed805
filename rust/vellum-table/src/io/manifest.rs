// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Reading and writing manifest files.
//!
//! A manifest file is the JSON encoding of a [`Manifest`].

use bytes::Bytes;
use object_store::path::Path;
use snafu::location;
use tracing::instrument;
use vellum_core::{Error, Result};
use vellum_io::object_store::ObjectStore;

use crate::format::Manifest;

/// Encode a manifest as it is stored on disk.
pub fn manifest_to_bytes(manifest: &Manifest) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(manifest)?))
}

/// Decode a manifest read from `path`.
pub fn manifest_from_bytes(path: &Path, bytes: &[u8]) -> Result<Manifest> {
    serde_json::from_slice(bytes).map_err(|e| {
        Error::corrupt_file(
            path.clone(),
            format!("failed to decode manifest: {}", e),
            location!(),
        )
    })
}

/// Read a manifest file.
#[instrument(level = "debug", skip(object_store))]
pub async fn read_manifest(object_store: &ObjectStore, path: &Path) -> Result<Manifest> {
    let bytes = object_store.read_one_all(path).await?;
    let manifest = manifest_from_bytes(path, &bytes)?;
    if !crate::feature_flags::can_read_dataset(manifest.reader_feature_flags) {
        return Err(Error::not_supported(
            format!(
                "Manifest {} requires reader features {:#x} that are not supported",
                path, manifest.reader_feature_flags
            ),
            location!(),
        ));
    }
    Ok(manifest)
}

/// Write a manifest file, replacing whatever is at `path`.
///
/// Publishing a new version must go through a
/// [`CommitHandler`](crate::io::commit::CommitHandler) instead.
pub async fn write_manifest(
    object_store: &ObjectStore,
    manifest: &Manifest,
    path: &Path,
) -> Result<u64> {
    let bytes = manifest_to_bytes(manifest)?;
    let size = bytes.len() as u64;
    object_store.put(path, bytes).await?;
    Ok(size)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::feature_flags::FLAG_UNKNOWN;
    use crate::format::{DataStorageFormat, FileVersion, Fragment, IndexMetadata};
    use vellum_core::datatypes::{Field, Schema};

    #[test_log::test(tokio::test)]
    async fn test_read_write_manifest() {
        let store = ObjectStore::memory();
        let schema = Schema::new(vec![Field::new("a", "int64", true)]);
        let fragment = Fragment::with_file(0, "data/a.vellum", &schema, FileVersion::V2_0, 20);
        let mut manifest = Manifest::new(
            schema,
            Arc::new(vec![fragment]),
            DataStorageFormat::default(),
        );
        manifest.indices = vec![IndexMetadata::new("a_idx", vec![0], 1).with_fragment_bitmap([0])];
        manifest.tag = Some("first".to_string());
        manifest.config.insert("key".to_string(), "value".to_string());

        let path = Path::from("t/_versions/1.manifest");
        let size = write_manifest(&store, &manifest, &path).await.unwrap();
        assert_eq!(size, store.size(&path).await.unwrap());
        let read = read_manifest(&store, &path).await.unwrap();
        assert_eq!(read, manifest);
    }

    #[test_log::test(tokio::test)]
    async fn test_unreadable_manifest() {
        let store = ObjectStore::memory();
        let path = Path::from("t/_versions/1.manifest");
        store.put(&path, b"not json".to_vec()).await.unwrap();
        assert!(matches!(
            read_manifest(&store, &path).await,
            Err(Error::CorruptFile { .. })
        ));

        let mut manifest = Manifest::empty(DataStorageFormat::default());
        manifest.reader_feature_flags = FLAG_UNKNOWN;
        write_manifest(&store, &manifest, &path).await.unwrap();
        assert!(matches!(
            read_manifest(&store, &path).await,
            Err(Error::NotSupported { .. })
        ));
    }
}
