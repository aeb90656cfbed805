// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! A task to clean up a vellum dataset, removing versions that are no longer
//! needed.
//!
//! The following types of files may be deleted by the cleanup function:
//!
//! * Old manifest files - If a manifest file matches the policy and is not
//!   the latest or a tagged manifest then it will be deleted.
//! * Transaction files - If a transaction file is only referenced by removed
//!   manifests then it will be deleted.
//! * Leftover temporary manifests from failed commits.
//!
//! A transaction file that no manifest references may belong to a commit that
//! is still in flight. Such files are only removed once they are at least 7
//! days old, or when `delete_unverified` is set (which should only be done if
//! the caller can guarantee there are no writes happening at the same time).

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, TimeDelta, Utc};
use futures::{future, stream, StreamExt, TryStreamExt};
use humantime::parse_duration;
use object_store::path::Path;
use tracing::{info, instrument, Span};
use vellum_table::format::{Manifest, TRANSACTIONS_DIR, TRANSACTION_EXTENSION};
use vellum_table::io::commit::ManifestLocation;
use vellum_table::io::manifest::read_manifest;

use super::refs::TagContents;
use crate::utils::temporal::utc_now;
use crate::{Dataset, Error, Result};

const TRACE_FILE_AUDIT: &str = "vellum::file_audit";
const AUDIT_MODE_DELETE: &str = "delete";
const AUDIT_MODE_DELETE_UNVERIFIED: &str = "delete_unverified";

/// How many manifests are read concurrently.
const MANIFEST_READ_PARALLELISM: usize = 8;

/// If a file cannot be verified then it will only be deleted if it is at least
/// this many days old.
const UNVERIFIED_THRESHOLD_DAYS: i64 = 7;

pub const AUTO_CLEANUP_INTERVAL_KEY: &str = "vellum.auto_cleanup.interval";
pub const AUTO_CLEANUP_OLDER_THAN_KEY: &str = "vellum.auto_cleanup.older_than";
pub const AUTO_CLEANUP_RETAIN_VERSIONS_KEY: &str = "vellum.auto_cleanup.retain_versions";

#[derive(Clone, Debug, Default)]
pub struct RemovalStats {
    pub bytes_removed: u64,
    pub old_versions: u64,
}

#[derive(Clone, Debug)]
struct CleanupTask<'a> {
    dataset: &'a Dataset,
    policy: CleanupPolicy,
}

/// Information about the dataset that we learn by inspecting all of the manifests
#[derive(Clone, Debug, Default)]
struct CleanupInspection {
    old_manifests: Vec<ManifestLocation>,
    /// Transaction files referenced by manifests we keep.
    referenced_tx_paths: HashSet<Path>,
    /// Transaction files referenced only by manifests being removed. These
    /// are known not to belong to an in-flight commit.
    verified_tx_paths: HashSet<Path>,
    /// Track tagged old versions in case we want to raise a `Cleanup` error.
    tagged_old_versions: HashSet<u64>,
}

impl<'a> CleanupTask<'a> {
    fn new(dataset: &'a Dataset, policy: CleanupPolicy) -> Self {
        Self { dataset, policy }
    }

    async fn run(self) -> Result<RemovalStats> {
        let tags = self.dataset.tags().list().await?;
        let tagged_versions: HashSet<u64> = tags
            .values()
            .map(|tag_content| tag_content.version)
            .collect();

        let inspection = self.process_manifests(&tagged_versions).await?;

        if self.policy.error_if_tagged_old_versions && !inspection.tagged_old_versions.is_empty() {
            return Err(tagged_old_versions_cleanup_error(
                &tags,
                &inspection.tagged_old_versions,
            ));
        }

        self.delete_unreferenced_files(inspection).await
    }

    #[instrument(level = "debug", skip_all)]
    async fn process_manifests(&self, tagged_versions: &HashSet<u64>) -> Result<CleanupInspection> {
        let object_store = &self.dataset.object_store;
        let manifests: Vec<(ManifestLocation, Manifest)> = self
            .dataset
            .commit_handler
            .list_manifest_locations(&self.dataset.base, object_store)
            .map_ok(|location| async move {
                let manifest = read_manifest(object_store, &location.path).await?;
                Ok::<_, Error>((location, manifest))
            })
            .try_buffer_unordered(MANIFEST_READ_PARALLELISM)
            .try_collect()
            .await?;

        let dataset_version = self.dataset.version().version;
        let mut inspection = CleanupInspection::default();
        for (location, manifest) in manifests {
            // Don't delete the latest version, even if it is old. Don't delete tagged versions,
            // regardless of age. Manifests newer than the checked out version were either added
            // since we started or are detached, so they stay too.
            let is_latest = dataset_version <= manifest.version;
            let is_tagged = tagged_versions.contains(&manifest.version);
            let should_clean = self.policy.should_clean(&manifest);
            let in_working_set = is_latest || !should_clean || is_tagged;

            if is_tagged && !is_latest && should_clean {
                inspection.tagged_old_versions.insert(manifest.version);
            }

            if let Some(tx_file) = &manifest.transaction_file {
                let tx_path = Path::from(TRANSACTIONS_DIR).child(tx_file.as_str());
                if in_working_set {
                    inspection.referenced_tx_paths.insert(tx_path);
                } else {
                    inspection.verified_tx_paths.insert(tx_path);
                }
            }
            if !in_working_set {
                inspection.old_manifests.push(location);
            }
        }
        Ok(inspection)
    }

    #[instrument(level = "debug", skip_all, fields(old_versions = inspection.old_manifests.len(), bytes_removed = tracing::field::Empty))]
    async fn delete_unreferenced_files(
        &self,
        inspection: CleanupInspection,
    ) -> Result<RemovalStats> {
        let object_store = &self.dataset.object_store;
        let verification_threshold = utc_now()
            - TimeDelta::try_days(UNVERIFIED_THRESHOLD_DAYS).unwrap_or(TimeDelta::MAX);

        let mut to_remove: Vec<(Path, u64)> = Vec::new();
        for location in &inspection.old_manifests {
            let size = match location.size {
                Some(size) => size,
                None => object_store.size(&location.path).await?,
            };
            info!(target: TRACE_FILE_AUDIT, mode = AUDIT_MODE_DELETE, r#type = "manifest", path = location.path.as_ref());
            to_remove.push((location.path.clone(), size));
        }

        let leftovers: Vec<(Path, u64)> = object_store
            .list(Some(self.dataset.base.clone()))
            .try_filter_map(|meta| {
                // A new-ish file might be part of an ongoing commit, so we only delete it
                // if an old manifest vouches for it.
                let maybe_in_progress = !self.policy.delete_unverified
                    && meta.last_modified >= verification_threshold;
                let path = self.path_if_not_referenced(meta.location, maybe_in_progress, &inspection);
                future::ready(Ok(path.map(|path| (path, meta.size))))
            })
            .try_collect()
            .await?;
        to_remove.extend(leftovers);

        let stats = RemovalStats {
            bytes_removed: to_remove.iter().map(|(_, size)| *size).sum(),
            old_versions: inspection.old_manifests.len() as u64,
        };

        stream::iter(to_remove)
            .map(|(path, _)| async move { object_store.delete(&path).await })
            .buffer_unordered(MANIFEST_READ_PARALLELISM)
            .try_for_each(|_| future::ready(Ok(())))
            .await?;

        Span::current().record("bytes_removed", stats.bytes_removed);
        Ok(stats)
    }

    fn path_if_not_referenced(
        &self,
        path: Path,
        maybe_in_progress: bool,
        inspection: &CleanupInspection,
    ) -> Option<Path> {
        let relative_path = match path.prefix_match(&self.dataset.base) {
            Some(parts) => Path::from_iter(parts),
            None => return None,
        };
        if relative_path.as_ref().starts_with("_versions/.tmp") {
            // A temporary manifest is leftover from a failed commit once nothing can
            // still be writing it.
            return (!maybe_in_progress).then_some(path);
        }
        if relative_path.as_ref().starts_with(TRANSACTIONS_DIR)
            && path.extension() == Some(TRANSACTION_EXTENSION)
        {
            if inspection.referenced_tx_paths.contains(&relative_path) {
                return None;
            } else if !maybe_in_progress {
                info!(target: TRACE_FILE_AUDIT, mode = AUDIT_MODE_DELETE_UNVERIFIED, r#type = "transaction", path = path.as_ref());
                return Some(path);
            } else if inspection.verified_tx_paths.contains(&relative_path) {
                info!(target: TRACE_FILE_AUDIT, mode = AUDIT_MODE_DELETE, r#type = "transaction", path = path.as_ref());
                return Some(path);
            }
        }
        None
    }
}

#[derive(Clone, Debug)]
pub struct CleanupPolicy {
    /// If not none, cleanup all versions before the specified timestamp.
    pub before_timestamp: Option<DateTime<Utc>>,
    /// If not none, cleanup all versions before the specified version.
    pub before_version: Option<u64>,
    /// If true, delete unverified files even if they are recent
    pub delete_unverified: bool,
    /// If true, return an Error if a tagged version is old
    pub error_if_tagged_old_versions: bool,
}

impl CleanupPolicy {
    pub fn should_clean(&self, manifest: &Manifest) -> bool {
        let mut should_clean = true;
        if let Some(before_timestamp) = self.before_timestamp {
            should_clean &= manifest.timestamp() < before_timestamp;
        }
        if let Some(before_version) = self.before_version {
            should_clean &= manifest.version < before_version;
        }
        should_clean
    }
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            before_timestamp: None,
            before_version: None,
            delete_unverified: false,
            error_if_tagged_old_versions: true,
        }
    }
}

#[derive(Default)]
pub struct CleanupPolicyBuilder {
    policy: CleanupPolicy,
}

impl CleanupPolicyBuilder {
    /// Cleanup all versions before the specified timestamp.
    pub fn before_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.policy.before_timestamp = Some(timestamp);
        self
    }

    /// Cleanup all versions except the last `n` versions of the dataset.
    pub async fn retain_n_versions(mut self, dataset: &Dataset, n: usize) -> Result<Self> {
        let versions = dataset.versions().await?;
        let keep_from = versions.len().saturating_sub(n.max(1));
        self.policy.before_version = versions.get(keep_from).map(|v| v.version);
        Ok(self)
    }

    /// Delete without verification.
    ///
    /// By default, transaction files no manifest references are only deleted
    /// once they are at least 7 days old. Only set this when no other writer
    /// can be committing to the dataset.
    pub fn delete_unverified(mut self, delete: bool) -> Self {
        self.policy.delete_unverified = delete;
        self
    }

    /// Return an error if any tagged versions match the parameters.
    pub fn error_if_tagged_old_versions(mut self, error: bool) -> Self {
        self.policy.error_if_tagged_old_versions = error;
        self
    }

    pub fn build(self) -> CleanupPolicy {
        self.policy
    }
}

/// Deletes old versions of a dataset, removing files that are no longer
/// needed.
///
/// The latest manifest is always considered valid and will not be removed
/// even if it satisfies the cleanup policy.
pub async fn cleanup_old_versions(
    dataset: &Dataset,
    policy: CleanupPolicy,
) -> Result<RemovalStats> {
    let cleanup = CleanupTask::new(dataset, policy);
    cleanup.run().await
}

/// Runs a cleanup after a commit when the table config asks for one.
///
/// Cleanup happens every `vellum.auto_cleanup.interval` versions, removing
/// versions older than `vellum.auto_cleanup.older_than` while keeping at least
/// `vellum.auto_cleanup.retain_versions` versions.
pub async fn auto_cleanup_hook(
    dataset: &Dataset,
    manifest: &Manifest,
) -> Result<Option<RemovalStats>> {
    let Some(interval) = manifest.config.get(AUTO_CLEANUP_INTERVAL_KEY) else {
        return Ok(None);
    };
    let interval: u64 = interval.parse().map_err(|e| Error::Cleanup {
        message: format!(
            "Error encountered while parsing {} as u64: {}",
            AUTO_CLEANUP_INTERVAL_KEY, e
        ),
    })?;
    if interval == 0 || manifest.version % interval != 0 {
        return Ok(None);
    }

    let mut builder = CleanupPolicyBuilder::default().error_if_tagged_old_versions(false);
    if let Some(older_than) = manifest.config.get(AUTO_CLEANUP_OLDER_THAN_KEY) {
        let std_older_than = parse_duration(older_than).map_err(|e| Error::Cleanup {
            message: format!(
                "Error encountered while parsing {} as a duration: {}",
                AUTO_CLEANUP_OLDER_THAN_KEY, e
            ),
        })?;
        let timestamp = utc_now() - TimeDelta::from_std(std_older_than).unwrap_or(TimeDelta::MAX);
        builder = builder.before_timestamp(timestamp);
    }
    if let Some(retain_versions) = manifest.config.get(AUTO_CLEANUP_RETAIN_VERSIONS_KEY) {
        let retain_versions: usize = retain_versions.parse().map_err(|e| Error::Cleanup {
            message: format!(
                "Error encountered while parsing {} as u64: {}",
                AUTO_CLEANUP_RETAIN_VERSIONS_KEY, e
            ),
        })?;
        builder = builder.retain_n_versions(dataset, retain_versions).await?;
    }

    Ok(Some(dataset.cleanup_with_policy(builder.build()).await?))
}

fn tagged_old_versions_cleanup_error(
    tags: &HashMap<String, TagContents>,
    tagged_old_versions: &HashSet<u64>,
) -> Error {
    let unreferenced_tags: HashMap<String, u64> = tags
        .iter()
        .filter(|(_, v)| tagged_old_versions.contains(&v.version))
        .map(|(k, v)| (k.clone(), v.version))
        .collect();

    Error::Cleanup {
        message: format!(
            "{} tagged version(s) have been marked for cleanup. Either set `error_if_tagged_old_versions=false` or delete the following tag(s) to enable cleanup: {:?}",
            unreferenced_tags.len(),
            unreferenced_tags
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use vellum_core::datatypes::{Field, Schema};
    use vellum_core::utils::tempfile::TempStrDir;

    use super::*;
    use crate::dataset::transaction::{Operation, TransactionBuilder};
    use crate::dataset::CommitBuilder;

    fn schema() -> Schema {
        Schema::new(vec![Field::new("x", "int32", true)])
    }

    async fn write_versions(uri: &str, count: u64) -> Dataset {
        for read_version in 0..count {
            let operation = if read_version == 0 {
                Operation::Overwrite {
                    fragments: vec![],
                    schema: schema(),
                    config_upsert_values: None,
                }
            } else {
                Operation::ReserveFragments { num_fragments: 1 }
            };
            let txn = TransactionBuilder::new(read_version)
                .operation(operation)
                .build()
                .unwrap();
            CommitBuilder::new(uri).execute(txn).await.unwrap();
        }
        Dataset::open(uri).await.unwrap()
    }

    async fn count_files(dataset: &Dataset, dir: &str) -> usize {
        dataset
            .object_store
            .list(Some(dataset.base.child(dir)))
            .try_collect::<Vec<_>>()
            .await
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn test_cleanup_keeps_latest() {
        let test_dir = TempStrDir::default();
        let dataset = write_versions(&test_dir, 3).await;

        let stats = dataset
            .cleanup_with_policy(CleanupPolicy::default())
            .await
            .unwrap();
        assert_eq!(stats.old_versions, 2);
        assert!(stats.bytes_removed > 0);

        let versions = dataset.versions().await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, 3);
        assert_eq!(count_files(&dataset, "_transactions").await, 1);

        // Removed versions can no longer be checked out.
        assert!(dataset.checkout_version(1).await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_before_version() {
        let test_dir = TempStrDir::default();
        let dataset = write_versions(&test_dir, 4).await;

        let policy = CleanupPolicy {
            before_version: Some(3),
            ..Default::default()
        };
        let stats = dataset.cleanup_with_policy(policy).await.unwrap();
        assert_eq!(stats.old_versions, 2);
        let versions: Vec<u64> = dataset
            .versions()
            .await
            .unwrap()
            .iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(versions, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_cleanup_nothing_old_enough() {
        let test_dir = TempStrDir::default();
        let dataset = write_versions(&test_dir, 3).await;

        let stats = dataset
            .cleanup_old_versions(TimeDelta::days(1), None, None)
            .await
            .unwrap();
        assert_eq!(stats.old_versions, 0);
        assert_eq!(stats.bytes_removed, 0);
        assert_eq!(dataset.versions().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_cleanup_tagged_versions() {
        let test_dir = TempStrDir::default();
        let dataset = write_versions(&test_dir, 3).await;
        dataset.tags().create("keep", 1).await.unwrap();

        let err = dataset
            .cleanup_with_policy(CleanupPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cleanup { .. }), "{}", err);
        assert!(err.to_string().contains("keep"), "{}", err);

        let policy = CleanupPolicyBuilder::default()
            .error_if_tagged_old_versions(false)
            .build();
        let stats = dataset.cleanup_with_policy(policy).await.unwrap();
        assert_eq!(stats.old_versions, 1);
        let versions: Vec<u64> = dataset
            .versions()
            .await
            .unwrap()
            .iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(versions, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_unverified_transaction_files() {
        let test_dir = TempStrDir::default();
        let dataset = write_versions(&test_dir, 2).await;
        let orphan = dataset.transactions_dir().child("7-orphan.txn");
        dataset.object_store.put(&orphan, b"{}".to_vec()).await.unwrap();

        // A fresh unreferenced transaction might still be committing.
        dataset
            .cleanup_with_policy(CleanupPolicy::default())
            .await
            .unwrap();
        assert!(dataset.object_store.exists(&orphan).await.unwrap());

        let policy = CleanupPolicyBuilder::default().delete_unverified(true).build();
        dataset.cleanup_with_policy(policy).await.unwrap();
        assert!(!dataset.object_store.exists(&orphan).await.unwrap());
        assert_eq!(count_files(&dataset, "_transactions").await, 1);
    }

    #[tokio::test]
    async fn test_retain_n_versions() {
        let test_dir = TempStrDir::default();
        let dataset = write_versions(&test_dir, 5).await;

        let policy = CleanupPolicyBuilder::default()
            .retain_n_versions(&dataset, 2)
            .await
            .unwrap()
            .build();
        assert_eq!(policy.before_version, Some(4));

        let policy = CleanupPolicyBuilder::default()
            .retain_n_versions(&dataset, 10)
            .await
            .unwrap()
            .build();
        assert_eq!(policy.before_version, Some(1));
    }

    #[tokio::test]
    async fn test_auto_cleanup_hook() {
        let test_dir = TempStrDir::default();
        let dataset = write_versions(&test_dir, 1).await;
        let txn = TransactionBuilder::new(1)
            .operation(Operation::UpdateConfig {
                upsert_values: Some(HashMap::from([
                    (AUTO_CLEANUP_INTERVAL_KEY.to_string(), "2".to_string()),
                    (AUTO_CLEANUP_RETAIN_VERSIONS_KEY.to_string(), "1".to_string()),
                ])),
                delete_keys: None,
            })
            .build()
            .unwrap();
        // Version 2 triggers the hook as part of the commit.
        let dataset = CommitBuilder::new(Arc::new(dataset))
            .execute(txn)
            .await
            .unwrap();
        assert_eq!(dataset.version().version, 2);
        let versions = dataset.versions().await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, 2);
    }

    #[tokio::test]
    async fn test_skip_auto_cleanup() {
        let test_dir = TempStrDir::default();
        let dataset = write_versions(&test_dir, 1).await;
        let txn = TransactionBuilder::new(1)
            .operation(Operation::UpdateConfig {
                upsert_values: Some(HashMap::from([
                    (AUTO_CLEANUP_INTERVAL_KEY.to_string(), "2".to_string()),
                    (AUTO_CLEANUP_RETAIN_VERSIONS_KEY.to_string(), "1".to_string()),
                ])),
                delete_keys: None,
            })
            .build()
            .unwrap();
        let dataset = CommitBuilder::new(Arc::new(dataset))
            .with_skip_auto_cleanup(true)
            .execute(txn)
            .await
            .unwrap();
        assert_eq!(dataset.version().version, 2);
        assert_eq!(dataset.versions().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_auto_cleanup_bad_config() {
        let test_dir = TempStrDir::default();
        let dataset = write_versions(&test_dir, 2).await;
        let mut manifest = dataset.manifest().clone();
        manifest
            .config
            .insert(AUTO_CLEANUP_INTERVAL_KEY.to_string(), "often".to_string());
        let err = auto_cleanup_hook(&dataset, &manifest).await.unwrap_err();
        assert!(matches!(err, Error::Cleanup { .. }), "{}", err);

        manifest
            .config
            .insert(AUTO_CLEANUP_INTERVAL_KEY.to_string(), "2".to_string());
        manifest
            .config
            .insert(AUTO_CLEANUP_OLDER_THAN_KEY.to_string(), "soon".to_string());
        let err = auto_cleanup_hook(&dataset, &manifest).await.unwrap_err();
        assert!(matches!(err, Error::Cleanup { .. }), "{}", err);

        manifest
            .config
            .insert(AUTO_CLEANUP_INTERVAL_KEY.to_string(), "3".to_string());
        assert!(auto_cleanup_hook(&dataset, &manifest).await.unwrap().is_none());
    }
}
