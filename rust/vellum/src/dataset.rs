// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Vellum Dataset
//!

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{prelude::*, Duration};
use futures::stream::{self, StreamExt, TryStreamExt};
use object_store::path::Path;
use serde::{Deserialize, Serialize};
use snafu::location;
use tracing::instrument;
use vellum_core::datatypes::Schema;
use vellum_io::object_store::ObjectStore;
use vellum_table::feature_flags::apply_feature_flags;
use vellum_table::format::{
    DataStorageFormat, Fragment, IndexMetadata, Manifest, TRANSACTIONS_DIR,
};
use vellum_table::io::commit::{
    CommitError, CommitHandler, ManifestLocation, ManifestNamingScheme,
};
use vellum_table::io::manifest::read_manifest;

use self::builder::DatasetBuilder;
use self::cleanup::{CleanupPolicy, RemovalStats};
use self::refs::{Ref, Tags};
use self::transaction::{Operation, Transaction};
use crate::io::commit::{commit_transaction, read_transaction_file};
use crate::utils::temporal::{timestamp_to_nanos, utc_now};
use crate::{Error, Result};

pub mod builder;
pub mod cleanup;
pub mod refs;
pub mod transaction;
mod write;

pub use write::{CommitBuilder, WriteDestination};

/// How many manifests are read concurrently when walking the history.
const HISTORY_READ_PARALLELISM: usize = 8;

/// Vellum Dataset
#[derive(Debug, Clone)]
pub struct Dataset {
    pub object_store: Arc<ObjectStore>,
    pub(crate) commit_handler: Arc<dyn CommitHandler>,
    /// Uri of the dataset.
    uri: String,
    pub(crate) base: Path,
    pub(crate) manifest: Arc<Manifest>,
    pub(crate) manifest_location: ManifestLocation,
    tags: Tags,
    pub manifest_naming_scheme: ManifestNamingScheme,
}

/// Dataset Version
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Version {
    /// version number
    pub version: u64,

    /// Timestamp of dataset creation in UTC.
    pub timestamp: DateTime<Utc>,

    /// The tag recorded by the transaction that created this version.
    pub tag: Option<String>,

    /// Key-value pairs of metadata.
    pub metadata: BTreeMap<String, String>,
}

/// Convert Manifest to Data Version.
impl From<&Manifest> for Version {
    fn from(m: &Manifest) -> Self {
        Self {
            version: m.version,
            timestamp: m.timestamp(),
            tag: m.tag.clone(),
            metadata: m
                .transaction_properties
                .as_ref()
                .map(|props| props.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
        }
    }
}

/// Options that shape how a manifest is written.
#[derive(Debug, Clone)]
pub struct ManifestWriteConfig {
    pub auto_set_feature_flags: bool,  // default true
    pub timestamp: Option<SystemTime>, // default None
    pub use_stable_row_ids: bool,      // default false
    pub storage_format: Option<DataStorageFormat>, // default None
}

impl Default for ManifestWriteConfig {
    fn default() -> Self {
        Self {
            auto_set_feature_flags: true,
            timestamp: None,
            use_stable_row_ids: false,
            storage_format: None,
        }
    }
}

impl Dataset {
    /// Open an existing dataset.
    ///
    /// See also [DatasetBuilder].
    #[instrument]
    pub async fn open(uri: &str) -> Result<Self> {
        DatasetBuilder::from_uri(uri).load().await
    }

    pub(crate) fn checkout_manifest(
        object_store: Arc<ObjectStore>,
        base_path: Path,
        uri: String,
        manifest: Manifest,
        manifest_location: ManifestLocation,
        commit_handler: Arc<dyn CommitHandler>,
    ) -> Self {
        let tags = Tags::new(
            object_store.clone(),
            commit_handler.clone(),
            base_path.clone(),
        );
        let manifest_naming_scheme = manifest_location.naming_scheme;
        Self {
            object_store,
            commit_handler,
            uri,
            base: base_path,
            manifest: Arc::new(manifest),
            manifest_location,
            tags,
            manifest_naming_scheme,
        }
    }

    /// Check out a dataset version with a ref
    pub async fn checkout_version(&self, version: impl Into<Ref>) -> Result<Self> {
        let ref_: Ref = version.into();
        match ref_ {
            Ref::Version(version) => self.checkout_by_version_number(version).await,
            Ref::Tag(tag) => self.checkout_by_tag(tag.as_str()).await,
        }
    }

    /// Check out the latest version of the dataset
    pub async fn checkout_latest(&mut self) -> Result<()> {
        let (manifest, location) = self.latest_manifest_and_location().await?;
        self.manifest = Arc::new(manifest);
        self.manifest_location = location;
        Ok(())
    }

    async fn checkout_by_version_number(&self, version: u64) -> Result<Self> {
        let manifest_location = self
            .commit_handler
            .resolve_version_location(&self.base, version, &self.object_store)
            .await?;
        let manifest = read_manifest(&self.object_store, &manifest_location.path).await?;
        Ok(Self::checkout_manifest(
            self.object_store.clone(),
            self.base.clone(),
            self.uri.clone(),
            manifest,
            manifest_location,
            self.commit_handler.clone(),
        ))
    }

    async fn checkout_by_tag(&self, tag: &str) -> Result<Self> {
        let version = self.tags.get_version(tag).await?;
        self.checkout_by_version_number(version).await
    }

    async fn latest_manifest_and_location(&self) -> Result<(Manifest, ManifestLocation)> {
        let location = self
            .commit_handler
            .resolve_latest_location(&self.base, &self.object_store)
            .await?;
        let manifest = read_manifest(&self.object_store, &location.path).await?;
        Ok((manifest, location))
    }

    pub async fn latest_manifest(&self) -> Result<Manifest> {
        Ok(self.latest_manifest_and_location().await?.0)
    }

    /// Read the transaction file for this version of the dataset.
    ///
    /// If there was no transaction file written for this version of the dataset
    /// then this will return None.
    pub async fn read_transaction(&self) -> Result<Option<Transaction>> {
        self.read_transaction_of(&self.manifest).await
    }

    /// Read the transaction that produced `version`.
    pub async fn read_transaction_by_version(&self, version: u64) -> Result<Option<Transaction>> {
        let location = self
            .commit_handler
            .resolve_version_location(&self.base, version, &self.object_store)
            .await?;
        let manifest = read_manifest(&self.object_store, &location.path).await?;
        self.read_transaction_of(&manifest).await
    }

    async fn read_transaction_of(&self, manifest: &Manifest) -> Result<Option<Transaction>> {
        match &manifest.transaction_file {
            Some(file) => read_transaction_file(&self.object_store, &self.base, file)
                .await
                .map(Some),
            None => Ok(None),
        }
    }

    /// Load the transactions committed after the checked out version.
    ///
    /// Returns the dataset checked out at the newest of them, and the
    /// transactions in ascending version order.
    pub(crate) async fn load_new_transactions(
        &self,
    ) -> Result<(Self, Vec<(u64, Arc<Transaction>)>)> {
        let (latest_manifest, latest_location) = self.latest_manifest_and_location().await?;
        if latest_manifest.version == self.manifest.version {
            return Ok((self.clone(), Vec::new()));
        }

        let versions = (self.manifest.version + 1)..=latest_manifest.version;
        let transactions = stream::iter(versions)
            .map(|version| async move {
                let transaction = self.read_transaction_by_version(version).await?;
                let transaction = transaction.ok_or_else(|| {
                    Error::internal(
                        format!("Dataset version {} does not have a transaction file", version),
                        location!(),
                    )
                })?;
                Ok::<_, Error>((version, Arc::new(transaction)))
            })
            .buffered(HISTORY_READ_PARALLELISM)
            .try_collect::<Vec<_>>()
            .await?;

        let latest = Self::checkout_manifest(
            self.object_store.clone(),
            self.base.clone(),
            self.uri.clone(),
            latest_manifest,
            latest_location,
            self.commit_handler.clone(),
        );
        Ok((latest, transactions))
    }

    /// Restore the currently checked out version of the dataset as the latest version.
    pub async fn restore(&mut self) -> Result<()> {
        let latest_version = self.latest_version_id().await?;
        let transaction = Transaction::new(
            latest_version,
            Operation::Restore {
                version: self.manifest.version,
            },
            None,
        );
        let write_config = ManifestWriteConfig {
            use_stable_row_ids: self.manifest.uses_stable_row_ids(),
            ..Default::default()
        };

        let (manifest, location) = commit_transaction(
            self,
            &self.object_store,
            self.commit_handler.as_ref(),
            &transaction,
            &write_config,
            &Default::default(),
            self.manifest_naming_scheme,
        )
        .await?;
        self.manifest = Arc::new(manifest);
        self.manifest_location = location;

        Ok(())
    }

    /// Removes old versions of the dataset from storage.
    ///
    /// Versions older than `older_than` are removed, except the latest one
    /// and tagged ones. Once a version is removed it can no longer be
    /// checked out or restored.
    pub async fn cleanup_old_versions(
        &self,
        older_than: Duration,
        delete_unverified: Option<bool>,
        error_if_tagged_old_versions: Option<bool>,
    ) -> Result<RemovalStats> {
        let before = utc_now() - older_than;
        let policy = CleanupPolicy {
            before_timestamp: Some(before),
            before_version: None,
            delete_unverified: delete_unverified.unwrap_or(false),
            error_if_tagged_old_versions: error_if_tagged_old_versions.unwrap_or(true),
        };
        self.cleanup_with_policy(policy).await
    }

    /// Removes old versions selected by `policy`.
    pub async fn cleanup_with_policy(&self, policy: CleanupPolicy) -> Result<RemovalStats> {
        cleanup::cleanup_old_versions(self, policy).await
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn manifest_location(&self) -> &ManifestLocation {
        &self.manifest_location
    }

    pub fn version(&self) -> Version {
        Version::from(self.manifest.as_ref())
    }

    /// Tags of this dataset.
    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    /// Get all versions.
    ///
    /// Detached versions are not included.
    pub async fn versions(&self) -> Result<Vec<Version>> {
        let mut versions: Vec<Version> = self
            .commit_handler
            .list_manifest_locations(&self.base, &self.object_store)
            .map_ok(|location| async move {
                let manifest = read_manifest(&self.object_store, &location.path).await?;
                Ok::<_, Error>(Version::from(&manifest))
            })
            .try_buffer_unordered(HISTORY_READ_PARALLELISM)
            .try_collect()
            .await?;

        versions.sort_by_key(|v| v.version);

        Ok(versions)
    }

    /// Get the latest version of the dataset.
    ///
    /// This is a fast path for checking whether a dataset has changed, so it
    /// does not read the manifest.
    pub async fn latest_version_id(&self) -> Result<u64> {
        Ok(self
            .commit_handler
            .resolve_latest_location(&self.base, &self.object_store)
            .await?
            .version)
    }

    /// Get the schema of the dataset
    pub fn schema(&self) -> &Schema {
        &self.manifest.schema
    }

    /// The table configuration of the checked out version.
    pub fn config(&self) -> &HashMap<String, String> {
        &self.manifest.config
    }

    pub fn count_fragments(&self) -> usize {
        self.manifest.fragments.len()
    }

    /// Count the rows of the checked out version.
    ///
    /// Deleted rows are not counted.
    pub fn count_rows(&self) -> Result<usize> {
        self.manifest.count_rows().ok_or_else(|| {
            Error::internal(
                format!(
                    "Version {} has fragments with an unknown number of rows",
                    self.manifest.version
                ),
                location!(),
            )
        })
    }

    /// Get fragments.
    pub fn get_fragments(&self) -> &[Fragment] {
        self.manifest.fragments.as_slice()
    }

    /// Get a fragment by id.
    pub fn get_fragment(&self, fragment_id: u64) -> Option<&Fragment> {
        self.get_fragments().iter().find(|f| f.id == fragment_id)
    }

    /// Read all indices of this Dataset version.
    pub async fn load_indices(&self) -> Result<Arc<Vec<IndexMetadata>>> {
        Ok(Arc::new(self.manifest.indices.clone()))
    }

    /// Find an index by name.
    pub async fn load_index_by_name(&self, name: &str) -> Result<Option<IndexMetadata>> {
        let indices = self.load_indices().await?;
        Ok(indices.iter().find(|idx| idx.name == name).cloned())
    }

    /// Whether the checked out version is outside the main lineage.
    pub fn is_detached(&self) -> bool {
        self.manifest.is_detached()
    }

    pub(crate) fn transactions_dir(&self) -> Path {
        self.base.child(TRANSACTIONS_DIR)
    }
}

/// Finish `manifest` and publish it through `commit_handler`.
pub(crate) async fn write_manifest_file(
    object_store: &ObjectStore,
    commit_handler: &dyn CommitHandler,
    base_path: &Path,
    manifest: &mut Manifest,
    config: &ManifestWriteConfig,
    naming_scheme: ManifestNamingScheme,
) -> std::result::Result<ManifestLocation, CommitError> {
    if config.auto_set_feature_flags {
        apply_feature_flags(manifest, config.use_stable_row_ids)?;
    }

    manifest.set_timestamp(timestamp_to_nanos(config.timestamp));

    manifest.update_max_fragment_id();

    commit_handler
        .commit(manifest, base_path, object_store, naming_scheme)
        .await
}

#[cfg(test)]
mod tests {
    use vellum_core::datatypes::Field;
    use vellum_table::format::FileVersion;

    use super::transaction::TransactionBuilder;
    use super::*;

    fn schema() -> Schema {
        Schema::new(vec![Field::new("id", "int64", false)])
    }

    async fn commit(uri: &str, read_version: u64, operation: Operation) -> Dataset {
        let txn = TransactionBuilder::new(read_version)
            .operation(operation)
            .build()
            .unwrap();
        CommitBuilder::new(uri).execute(txn).await.unwrap()
    }

    fn rows(n: usize) -> Fragment {
        Fragment::with_file(0, "data/x.vellum", &schema(), FileVersion::V2_0, n)
    }

    #[tokio::test]
    async fn test_checkout_and_history() {
        let uri = "memory://dataset_history";
        commit(
            uri,
            0,
            Operation::Overwrite {
                fragments: vec![rows(3)],
                schema: schema(),
                config_upsert_values: None,
            },
        )
        .await;
        commit(uri, 1, Operation::Append { fragments: vec![rows(4)] }).await;

        let mut dataset = Dataset::open(uri).await.unwrap();
        assert_eq!(dataset.version().version, 2);
        assert_eq!(dataset.count_rows().unwrap(), 7);
        assert_eq!(dataset.count_fragments(), 2);
        assert!(dataset.get_fragment(1).is_some());

        let first = dataset.checkout_version(1).await.unwrap();
        assert_eq!(first.count_rows().unwrap(), 3);
        assert_eq!(first.latest_version_id().await.unwrap(), 2);

        let versions = dataset.versions().await.unwrap();
        assert_eq!(
            versions.iter().map(|v| v.version).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(versions[0].timestamp <= versions[1].timestamp);

        let (latest, transactions) = first.load_new_transactions().await.unwrap();
        assert_eq!(latest.version().version, 2);
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].0, 2);
        assert_eq!(transactions[0].1.operation.name(), "Append");

        commit(uri, 2, Operation::ReserveFragments { num_fragments: 1 }).await;
        dataset.checkout_latest().await.unwrap();
        assert_eq!(dataset.version().version, 3);
    }

    #[tokio::test]
    async fn test_restore() {
        let uri = "memory://dataset_restore";
        commit(
            uri,
            0,
            Operation::Overwrite {
                fragments: vec![rows(3)],
                schema: schema(),
                config_upsert_values: None,
            },
        )
        .await;
        commit(uri, 1, Operation::Append { fragments: vec![rows(4)] }).await;

        let dataset = Dataset::open(uri).await.unwrap();
        let mut first = dataset.checkout_version(1).await.unwrap();
        first.restore().await.unwrap();
        assert_eq!(first.version().version, 3);
        assert_eq!(first.count_rows().unwrap(), 3);

        let txn = first.read_transaction().await.unwrap().unwrap();
        assert_eq!(txn.operation, Operation::Restore { version: 1 });
        assert_eq!(txn.read_version, 2);
    }

    #[tokio::test]
    async fn test_restore_keeps_stable_row_ids() {
        let uri = "memory://dataset_restore_row_ids";
        let txn = TransactionBuilder::new(0)
            .operation(Operation::Overwrite {
                fragments: vec![],
                schema: schema(),
                config_upsert_values: None,
            })
            .build()
            .unwrap();
        CommitBuilder::new(uri)
            .use_stable_row_ids(true)
            .execute(txn)
            .await
            .unwrap();

        let mut dataset = Dataset::open(uri).await.unwrap();
        assert!(dataset.manifest().uses_stable_row_ids());
        dataset.restore().await.unwrap();
        assert_eq!(dataset.version().version, 2);
        assert!(dataset.manifest().uses_stable_row_ids());

        let appended = commit(uri, 2, Operation::Append { fragments: vec![rows(5)] }).await;
        assert!(appended.manifest().uses_stable_row_ids());
        assert!(appended.get_fragments()[0].row_id_meta.is_some());
    }

    #[tokio::test]
    async fn test_open_missing() {
        let err = Dataset::open("memory://dataset_missing").await.unwrap_err();
        assert!(matches!(err, Error::DatasetNotFound { .. }), "{}", err);
    }
}
