// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

use std::{collections::HashMap, sync::Arc};

use crate::object_store::{ObjectStore, ObjectStoreParams, ObjectStoreProvider, StorageOptions};
use object_store::{local::LocalFileSystem, path::Path};
use snafu::location;
use url::Url;
use vellum_core::error::Result;
use vellum_core::Error;

#[derive(Default, Debug)]
pub struct FileStoreProvider;

impl FileStoreProvider {
    pub(crate) fn store() -> ObjectStore {
        ObjectStore::new(Arc::new(LocalFileSystem::new()), "file", false)
    }
}

#[async_trait::async_trait]
impl ObjectStoreProvider for FileStoreProvider {
    async fn new_store(&self, base_path: Url, params: &ObjectStoreParams) -> Result<ObjectStore> {
        let storage_options = StorageOptions(params.storage_options.clone().unwrap_or_default());
        let list_is_lexically_ordered = params
            .list_is_lexically_ordered
            .or(storage_options.list_is_lexically_ordered())
            .unwrap_or(false);
        Ok(ObjectStore::new(
            Arc::new(LocalFileSystem::new()),
            base_path.scheme(),
            list_is_lexically_ordered,
        ))
    }

    fn extract_path(&self, url: &Url) -> Result<Path> {
        if let Ok(file_path) = url.to_file_path() {
            if let Ok(path) = Path::from_absolute_path(&file_path) {
                return Ok(path);
            }
        }

        Path::parse(url.path()).map_err(|e| {
            Error::invalid_input(
                format!("Failed to parse path '{}': {}", url.path(), e),
                location!(),
            )
        })
    }

    fn calculate_object_store_prefix(
        &self,
        scheme: &str,
        _authority: &str,
        _storage_options: Option<&HashMap<String, String>>,
    ) -> Result<String> {
        Ok(scheme.to_string())
    }
}

#[cfg(test)]
mod tests {
    use crate::object_store::uri_to_url;

    use super::*;

    #[test]
    fn test_file_store_path() {
        let provider = FileStoreProvider;

        let cases = [
            ("file:///", ""),
            ("file:///usr/local/bin", "usr/local/bin"),
            ("file-object-store:///path/to/file", "path/to/file"),
            ("file:///path/to/foo/../bar", "path/to/bar"),
        ];

        for (uri, expected_path) in cases {
            let url = uri_to_url(uri).unwrap();
            let path = provider.extract_path(&url).unwrap();
            assert_eq!(path.as_ref(), expected_path, "uri: '{}'", uri);
        }
    }

    #[test]
    fn test_calculate_object_store_prefix() {
        let provider = FileStoreProvider;
        for scheme in ["file", "file-object-store"] {
            assert_eq!(
                scheme,
                provider
                    .calculate_object_store_prefix(scheme, "etc", None)
                    .unwrap()
            );
        }
    }
}
