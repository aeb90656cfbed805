// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

use std::{collections::HashMap, sync::Arc};

use crate::object_store::{ObjectStore, ObjectStoreParams, ObjectStoreProvider, StorageOptions};
use object_store::{memory::InMemory, path::Path};
use url::Url;
use vellum_core::error::Result;

/// Provides in-memory object stores.
///
/// Every `memory://` URL maps to the same cache prefix, so within one
/// registry all of them share a single [`InMemory`] store and the URL
/// authority becomes the first path segment.
#[derive(Default, Debug)]
pub struct MemoryStoreProvider;

impl MemoryStoreProvider {
    pub(crate) fn store() -> ObjectStore {
        ObjectStore::new(Arc::new(InMemory::new()), "memory", true)
    }
}

#[async_trait::async_trait]
impl ObjectStoreProvider for MemoryStoreProvider {
    async fn new_store(&self, _base_path: Url, params: &ObjectStoreParams) -> Result<ObjectStore> {
        let mut store = Self::store();
        let storage_options = StorageOptions(params.storage_options.clone().unwrap_or_default());
        if let Some(ordered) = params
            .list_is_lexically_ordered
            .or(storage_options.list_is_lexically_ordered())
        {
            store.list_is_lexically_ordered = ordered;
        }
        Ok(store)
    }

    fn extract_path(&self, url: &Url) -> Result<Path> {
        let mut output = String::new();
        if let Some(domain) = url.domain() {
            output.push_str(domain);
        }
        output.push_str(url.path());
        Ok(Path::from(output))
    }

    fn calculate_object_store_prefix(
        &self,
        _scheme: &str,
        _authority: &str,
        _storage_options: Option<&HashMap<String, String>>,
    ) -> Result<String> {
        Ok("memory".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_path() {
        let provider = MemoryStoreProvider;

        let url = Url::parse("memory://path/to/file").unwrap();
        let path = provider.extract_path(&url).unwrap();
        let expected_path = Path::from("path/to/file");
        assert_eq!(path, expected_path);
    }

    #[test]
    fn test_calculate_object_store_prefix() {
        let provider = MemoryStoreProvider;
        assert_eq!(
            "memory",
            provider
                .calculate_object_store_prefix("memory", "etc", None)
                .unwrap()
        );
    }
}
