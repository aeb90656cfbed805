// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

use std::sync::Arc;

use object_store::path::Path;
use snafu::location;
use vellum_core::error::box_error;
use vellum_io::object_store::{
    default_registry, NamespaceStorageOptionsProvider, ObjectStore, ObjectStoreParams,
    ObjectStoreRegistry,
};
use vellum_namespace::models::{CreateTableVersionRequest, DescribeTableRequest};
use vellum_namespace::Namespace;
use vellum_table::format::{DataStorageFormat, FileVersion};
use vellum_table::io::commit::{
    commit_handler_from_url, CommitConfig, CommitHandler, ManifestNamingScheme,
};
use vellum_table::io::manifest::read_manifest;

use crate::dataset::transaction::{validate_operation, Operation, Transaction};
use crate::dataset::ManifestWriteConfig;
use crate::io::commit::{commit_detached_transaction, commit_new_dataset, commit_transaction};
use crate::{Dataset, Error, Result};

use super::WriteDestination;

/// Create a new commit from a [`Transaction`].
///
/// Transactions can be created with [`crate::dataset::transaction::TransactionBuilder`].
#[derive(Debug, Clone)]
pub struct CommitBuilder<'a> {
    dest: WriteDestination<'a>,
    use_stable_row_ids: Option<bool>,
    enable_v2_manifest_paths: bool,
    storage_format: Option<FileVersion>,
    commit_handler: Option<Arc<dyn CommitHandler>>,
    store_params: Option<ObjectStoreParams>,
    object_store_registry: Arc<ObjectStoreRegistry>,
    object_store: Option<Arc<ObjectStore>>,
    namespace: Option<(Arc<dyn Namespace>, Vec<String>)>,
    detached: bool,
    commit_config: CommitConfig,
}

impl<'a> CommitBuilder<'a> {
    pub fn new(dest: impl Into<WriteDestination<'a>>) -> Self {
        Self {
            dest: dest.into(),
            use_stable_row_ids: None,
            enable_v2_manifest_paths: false,
            storage_format: None,
            commit_handler: None,
            store_params: None,
            object_store_registry: default_registry(),
            object_store: None,
            namespace: None,
            detached: false,
            commit_config: Default::default(),
        }
    }

    /// Whether to use stable row ids.
    ///
    /// This is only used for new datasets. Existing datasets will use their
    /// existing setting.
    ///
    /// **Default is false.**
    pub fn use_stable_row_ids(mut self, use_stable_row_ids: bool) -> Self {
        self.use_stable_row_ids = Some(use_stable_row_ids);
        self
    }

    /// Pass the storage format to use for the dataset.
    ///
    /// This is only needed when creating a new empty table. If any data files are
    /// passed, the storage format will be inferred from the data files.
    ///
    /// All data files must use the same storage format as the existing dataset.
    /// If a different format is passed, an error will be returned.
    pub fn with_storage_format(mut self, storage_format: FileVersion) -> Self {
        self.storage_format = Some(storage_format);
        self
    }

    /// Pass an object store to use.
    pub fn with_object_store(mut self, object_store: Arc<ObjectStore>) -> Self {
        self.object_store = Some(object_store);
        self
    }

    /// Pass a commit handler to use for the dataset.
    pub fn with_commit_handler(mut self, commit_handler: Arc<dyn CommitHandler>) -> Self {
        self.commit_handler = Some(commit_handler);
        self
    }

    /// Pass store parameters to use for the dataset.
    ///
    /// If an object store is passed, these parameters will be ignored.
    pub fn with_store_params(mut self, store_params: ObjectStoreParams) -> Self {
        self.store_params = Some(store_params);
        self
    }

    /// Pass an object store registry to use.
    ///
    /// If an object store is passed, this registry will be ignored.
    pub fn with_object_store_registry(
        mut self,
        object_store_registry: Arc<ObjectStoreRegistry>,
    ) -> Self {
        self.object_store_registry = object_store_registry;
        self
    }

    /// Resolve the table through a namespace.
    ///
    /// When committing to a URI, the location reported by
    /// [`Namespace::describe_table`] replaces it, storage options are fetched
    /// from the namespace, and the namespace is told about the new version
    /// once the commit succeeds.
    pub fn with_namespace(mut self, namespace: Arc<dyn Namespace>, table_id: Vec<String>) -> Self {
        self.namespace = Some((namespace, table_id));
        self
    }

    ///  If set to true, and this is a new dataset, uses the v2 manifest
    ///  paths. These allow constant-time lookups for the latest manifest on object storage.
    ///  This parameter has no effect on existing datasets. **Default is False.**
    pub fn enable_v2_manifest_paths(mut self, enable: bool) -> Self {
        self.enable_v2_manifest_paths = enable;
        self
    }

    /// Commit a version that is not part of the mainline history.
    ///
    /// This commit will never show up in the dataset's history.
    ///
    /// This can be used to stage changes or to handle "secondary" datasets
    /// whose lineage is tracked elsewhere.
    pub fn with_detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }

    /// Set the maximum number of retries for commit operations.
    ///
    /// If a commit loses the race for the next version, it will be retried up
    /// to `max_retries` times. **Default is 0.**
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.commit_config.num_retries = max_retries;
        self
    }

    /// Skip the auto cleanup that would otherwise run after a successful commit.
    pub fn with_skip_auto_cleanup(mut self, skip_auto_cleanup: bool) -> Self {
        self.commit_config.skip_auto_cleanup = skip_auto_cleanup;
        self
    }

    async fn resolve_uri(&self, uri: &str) -> Result<String> {
        let Some((namespace, table_id)) = &self.namespace else {
            return Ok(uri.to_owned());
        };
        let response = namespace
            .describe_table(DescribeTableRequest {
                id: Some(table_id.clone()),
                version: None,
            })
            .await
            .map_err(|e| Error::Namespace {
                source: box_error(e),
                location: location!(),
            })?;
        Ok(response.location.unwrap_or_else(|| uri.to_owned()))
    }

    fn resolve_store_params(&self) -> ObjectStoreParams {
        let params = self.store_params.clone().unwrap_or_default();
        match &self.namespace {
            Some((namespace, table_id)) => params.with_storage_options_provider(Arc::new(
                NamespaceStorageOptionsProvider::new(namespace.clone(), table_id.clone()),
            )),
            None => params,
        }
    }

    pub async fn execute(self, transaction: Transaction) -> Result<Dataset> {
        let (object_store, base_path, commit_handler, uri, existing) = match &self.dest {
            WriteDestination::Dataset(dataset) => (
                dataset.object_store.clone(),
                dataset.base.clone(),
                dataset.commit_handler.clone(),
                dataset.uri().to_owned(),
                Some(dataset.clone()),
            ),
            WriteDestination::Uri(uri) => {
                let uri = self.resolve_uri(uri).await?;
                let (object_store, base_path) = ObjectStore::from_uri_and_params(
                    self.object_store_registry.clone(),
                    &uri,
                    &self.resolve_store_params(),
                )
                .await?;
                let object_store = self.object_store.clone().unwrap_or(object_store);
                let commit_handler = match &self.commit_handler {
                    Some(commit_handler) => commit_handler.clone(),
                    None => commit_handler_from_url(&uri)?,
                };

                // Check if it already exists.
                let existing = match commit_handler
                    .resolve_latest_location(&base_path, &object_store)
                    .await
                {
                    Ok(location) => {
                        let manifest = read_manifest(&object_store, &location.path).await?;
                        Some(Arc::new(Dataset::checkout_manifest(
                            object_store.clone(),
                            base_path.clone(),
                            uri.clone(),
                            manifest,
                            location,
                            commit_handler.clone(),
                        )))
                    }
                    Err(Error::DatasetNotFound { .. } | Error::NotFound { .. }) => None,
                    Err(e) => return Err(e),
                };
                (object_store, base_path, commit_handler, uri, existing)
            }
        };

        if existing.is_none() && !matches!(transaction.operation, Operation::Overwrite { .. }) {
            return Err(Error::dataset_not_found(
                base_path.to_string(),
                "The dataset must already exist unless the operation is Overwrite",
                location!(),
            ));
        }
        validate_operation(
            existing.as_ref().map(|ds| ds.manifest.as_ref()),
            &transaction.operation,
        )?;

        let manifest_naming_scheme = existing
            .as_ref()
            .map(|ds| ds.manifest_naming_scheme)
            .unwrap_or_else(|| {
                ManifestNamingScheme::from_enable_v2(self.enable_v2_manifest_paths)
            });

        let use_stable_row_ids = if let Some(ds) = &existing {
            ds.manifest.uses_stable_row_ids()
        } else {
            self.use_stable_row_ids.unwrap_or(false)
        };

        // Validate storage format matches existing dataset
        if let (Some(ds), Some(storage_format)) = (&existing, self.storage_format) {
            let passed_storage_format = DataStorageFormat::new(storage_format);
            if ds.manifest.data_storage_format != passed_storage_format
                && !matches!(transaction.operation, Operation::Overwrite { .. })
            {
                return Err(Error::invalid_input(
                    format!(
                        "Storage format mismatch. Existing dataset uses {:?}, but new data uses {:?}",
                        ds.manifest.data_storage_format, passed_storage_format
                    ),
                    location!(),
                ));
            }
        }

        let manifest_config = ManifestWriteConfig {
            use_stable_row_ids,
            storage_format: self.storage_format.map(DataStorageFormat::new),
            ..Default::default()
        };

        let (manifest, manifest_location) = if let Some(dataset) = &existing {
            if self.detached {
                if matches!(manifest_naming_scheme, ManifestNamingScheme::V1) {
                    return Err(Error::NotSupported {
                        source: "detached commits cannot be used with v1 manifest paths".into(),
                        location: location!(),
                    });
                }
                commit_detached_transaction(
                    dataset,
                    object_store.as_ref(),
                    commit_handler.as_ref(),
                    &transaction,
                    &manifest_config,
                    &self.commit_config,
                )
                .await?
            } else {
                commit_transaction(
                    dataset,
                    object_store.as_ref(),
                    commit_handler.as_ref(),
                    &transaction,
                    &manifest_config,
                    &self.commit_config,
                    manifest_naming_scheme,
                )
                .await?
            }
        } else if self.detached {
            return Err(Error::NotSupported {
                source: "detached commits cannot currently be used to create new datasets".into(),
                location: location!(),
            });
        } else {
            commit_new_dataset(
                object_store.as_ref(),
                commit_handler.as_ref(),
                &base_path,
                &transaction,
                &manifest_config,
                manifest_naming_scheme,
            )
            .await?
        };

        if let (Some((namespace, table_id)), WriteDestination::Uri(_), false) =
            (&self.namespace, &self.dest, self.detached)
        {
            notify_namespace(
                namespace.as_ref(),
                table_id,
                manifest.version,
                &manifest_location.path,
            )
            .await?;
        }

        Ok(Dataset::checkout_manifest(
            object_store,
            base_path,
            uri,
            manifest,
            manifest_location,
            commit_handler,
        ))
    }
}

async fn notify_namespace(
    namespace: &dyn Namespace,
    table_id: &[String],
    version: u64,
    manifest_path: &Path,
) -> Result<()> {
    namespace
        .create_table_version(CreateTableVersionRequest {
            id: Some(table_id.to_vec()),
            version: version as i64,
            manifest_path: Some(manifest_path.to_string()),
        })
        .await
        .map_err(|e| Error::Namespace {
            source: box_error(e),
            location: location!(),
        })?;
    Ok(())
}
