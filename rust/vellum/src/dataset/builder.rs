// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

use std::collections::HashMap;
use std::sync::Arc;

use snafu::location;
use vellum_io::object_store::{
    default_registry, ObjectStore, ObjectStoreParams, ObjectStoreRegistry,
};
use vellum_table::io::commit::{commit_handler_from_url, CommitHandler};
use vellum_table::io::manifest::read_manifest;

use crate::{Dataset, Error, Result};

/// builder for loading a [`Dataset`].
#[derive(Debug)]
pub struct DatasetBuilder {
    options: ObjectStoreParams,
    commit_handler: Option<Arc<dyn CommitHandler>>,
    object_store_registry: Arc<ObjectStoreRegistry>,
    version: Option<u64>,
    table_uri: String,
}

impl DatasetBuilder {
    pub fn from_uri<T: AsRef<str>>(table_uri: T) -> Self {
        Self {
            table_uri: table_uri.as_ref().to_string(),
            options: ObjectStoreParams::default(),
            commit_handler: None,
            object_store_registry: default_registry(),
            version: None,
        }
    }
}

impl DatasetBuilder {
    /// Sets `version` to the builder
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_commit_handler(mut self, commit_handler: Arc<dyn CommitHandler>) -> Self {
        self.commit_handler = Some(commit_handler);
        self
    }

    /// Use the store parameters of a writer, including any storage options
    /// provider.
    pub fn with_store_params(mut self, params: ObjectStoreParams) -> Self {
        self.options = params;
        self
    }

    /// Resolve stores through `registry` instead of the process-wide one.
    pub fn with_object_store_registry(mut self, registry: Arc<ObjectStoreRegistry>) -> Self {
        self.object_store_registry = registry;
        self
    }

    /// Set options used to initialize storage backend
    pub fn with_storage_options(mut self, storage_options: HashMap<String, String>) -> Self {
        self.options.storage_options = Some(storage_options);
        self
    }

    /// Set a single option used to initialize storage backend
    pub fn with_storage_option(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        let mut storage_options = self.options.storage_options.unwrap_or_default();
        storage_options.insert(key.as_ref().to_string(), value.as_ref().to_string());
        self.options.storage_options = Some(storage_options);
        self
    }

    pub async fn load(self) -> Result<Dataset> {
        let (object_store, base_path) = ObjectStore::from_uri_and_params(
            self.object_store_registry.clone(),
            &self.table_uri,
            &self.options,
        )
        .await?;
        let commit_handler = match self.commit_handler {
            Some(commit_handler) => commit_handler,
            None => commit_handler_from_url(&self.table_uri)?,
        };

        let location = match self.version {
            Some(version) => {
                commit_handler
                    .resolve_version_location(&base_path, version, &object_store)
                    .await?
            }
            None => commit_handler
                .resolve_latest_location(&base_path, &object_store)
                .await
                .map_err(|e| Error::DatasetNotFound {
                    path: base_path.to_string(),
                    source: Box::new(e),
                    location: location!(),
                })?,
        };
        let manifest = read_manifest(&object_store, &location.path).await?;

        Ok(Dataset::checkout_manifest(
            object_store,
            base_path,
            self.table_uri,
            manifest,
            location,
            commit_handler,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_missing_version() {
        let err = DatasetBuilder::from_uri("memory://builder_missing")
            .with_version(3)
            .load()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }), "{}", err);
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let err = DatasetBuilder::from_uri("gopher://host/table")
            .load()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }), "{}", err);
    }
}
