// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Trait for commit implementations.
//!
//! In Vellum, a transaction is committed by writing the next manifest file.
//! However, care should be taken to ensure that the manifest file is written
//! only once, even if there are concurrent writers. Different stores have
//! different abilities to handle concurrent writes, so a trait is provided
//! to allow for different implementations.
//!
//! The trait [CommitHandler] can be implemented to provide different commit
//! strategies. The default implementation is [ConditionalPutCommitHandler],
//! which writes the manifest with a create-if-absent put, so exactly one
//! writer can claim each version slot. [RenameCommitHandler] writes to a
//! temporary path and renames it into place if no object already exists at
//! the final path. [UnsafeCommitHandler] writes without any checks.
//!
//! When providing your own commit handler, most often you are implementing in
//! terms of a lock. The trait [CommitLock] can be implemented as a simpler
//! alternative to [CommitHandler].
//!
//! # Manifest naming
//!
//! Manifests live under `_versions/`. With [ManifestNamingScheme::V1] the file
//! for version `v` is `{v}.manifest`. With [ManifestNamingScheme::V2] it is
//! `{u64::MAX - v:020}.manifest`, so a lexically ordered listing returns the
//! newest version first, and a small `_latest_version.json` hint records the
//! last committed version. Detached manifests are written to
//! `d{version}.manifest` and are never returned when resolving the latest
//! version or listing the lineage.

use std::fmt::Debug;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use futures::{future, stream::BoxStream, StreamExt, TryStreamExt};
use object_store::{path::Path, Error as ObjectStoreError, PutMode, PutPayload};
use serde::{Deserialize, Serialize};
use snafu::location;
use tracing::instrument;
use url::Url;
use vellum_core::{Error, Result};
use vellum_io::object_store::ObjectStore;

use crate::format::{is_detached_version, Manifest};
use crate::io::manifest::manifest_to_bytes;

pub const VERSIONS_DIR: &str = "_versions";
const MANIFEST_EXTENSION: &str = "manifest";
const DETACHED_VERSION_PREFIX: &str = "d";
const LATEST_VERSION_HINT: &str = "_latest_version.json";

/// How manifest files are named within `_versions/`.
///
/// A dataset uses exactly one scheme for its whole lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestNamingScheme {
    /// `_versions/{version}.manifest`
    V1,
    /// `_versions/{u64::MAX - version:020}.manifest`
    V2,
}

impl ManifestNamingScheme {
    pub fn from_enable_v2(enable_v2_manifest_paths: bool) -> Self {
        if enable_v2_manifest_paths {
            Self::V2
        } else {
            Self::V1
        }
    }

    pub fn manifest_path(&self, base: &Path, version: u64) -> Path {
        let directory = base.child(VERSIONS_DIR);
        if is_detached_version(version) {
            // Detached versions should never show up first in a list operation which
            // means it needs to come lexicographically after all attached manifest
            // files and so we add the prefix `d`.
            return directory.child(format!(
                "{DETACHED_VERSION_PREFIX}{version}.{MANIFEST_EXTENSION}"
            ));
        }
        match self {
            Self::V1 => directory.child(format!("{version}.{MANIFEST_EXTENSION}")),
            Self::V2 => {
                let inverted_version = u64::MAX - version;
                directory.child(format!("{inverted_version:020}.{MANIFEST_EXTENSION}"))
            }
        }
    }

    /// Parse the version from a manifest file name, e.g. `3.manifest`.
    ///
    /// Detached manifests and files that are not manifests return `None`.
    pub fn parse_version(&self, filename: &str) -> Option<u64> {
        let file_number = filename
            .split_once('.')
            .filter(|(_, extension)| *extension == MANIFEST_EXTENSION)
            // Detached manifests start with `d` and fail to parse here.
            .and_then(|(version_str, _)| version_str.parse::<u64>().ok())?;
        match self {
            Self::V1 => Some(file_number),
            Self::V2 => Some(u64::MAX - file_number),
        }
    }

    /// Detect the naming scheme a manifest file name was written with.
    pub fn detect_scheme(filename: &str) -> Option<Self> {
        if filename.starts_with(DETACHED_VERSION_PREFIX) {
            return None;
        }
        let (version_str, extension) = filename.split_once('.')?;
        if extension != MANIFEST_EXTENSION
            || version_str.is_empty()
            || !version_str.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }
        if version_str.len() == 20 {
            Some(Self::V2)
        } else {
            Some(Self::V1)
        }
    }
}

/// Parse the version of a non-detached manifest path, in either scheme.
pub fn parse_version_from_path(path: &Path) -> Result<u64> {
    path.filename()
        .and_then(|name| {
            ManifestNamingScheme::detect_scheme(name)
                .and_then(|scheme| scheme.parse_version(name))
        })
        .ok_or_else(|| {
            Error::internal(
                format!("Expected manifest file, but found {}", path),
                location!(),
            )
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestLocation {
    /// The version the manifest corresponds to.
    pub version: u64,
    /// Path of the manifest file.
    pub path: Path,
    /// Size, in bytes, of the manifest file. If it is not known, this field should be `None`.
    pub size: Option<u64>,
    /// Naming scheme of the manifest file.
    pub naming_scheme: ManifestNamingScheme,
}

#[derive(Debug, Serialize, Deserialize)]
struct LatestVersionHint {
    version: u64,
}

fn latest_version_hint_path(base: &Path) -> Path {
    base.child(VERSIONS_DIR).child(LATEST_VERSION_HINT)
}

/// Record `version` as the latest committed version.
///
/// The hint only speeds up resolving the latest version. Readers probe past a
/// stale hint, so failing to write it never fails a commit.
pub async fn write_latest_version_hint(object_store: &ObjectStore, base: &Path, version: u64) {
    let path = latest_version_hint_path(base);
    let result = match serde_json::to_vec(&LatestVersionHint { version }) {
        Ok(bytes) => object_store.put(&path, bytes).await,
        Err(e) => Err(e.into()),
    };
    if let Err(e) = result {
        log::warn!(
            "Failed to write latest version hint {} for version {}: {}",
            path,
            version,
            e
        );
    }
}

async fn read_latest_version_hint(object_store: &ObjectStore, base: &Path) -> Option<u64> {
    let bytes = object_store
        .read_one_all(&latest_version_hint_path(base))
        .await
        .ok()?;
    serde_json::from_slice::<LatestVersionHint>(&bytes)
        .ok()
        .map(|hint| hint.version)
}

async fn head_manifest(
    object_store: &ObjectStore,
    base: &Path,
    version: u64,
    naming_scheme: ManifestNamingScheme,
) -> Result<Option<ManifestLocation>> {
    let path = naming_scheme.manifest_path(base, version);
    match object_store.inner.head(&path).await {
        Ok(meta) => Ok(Some(ManifestLocation {
            version,
            path,
            size: Some(meta.size),
            naming_scheme,
        })),
        Err(ObjectStoreError::NotFound { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Resolve the latest version from the hint, probing forward past it.
///
/// Returns `None` if there is no usable hint.
async fn current_manifest_from_hint(
    object_store: &ObjectStore,
    base: &Path,
) -> Result<Option<ManifestLocation>> {
    let Some(hinted) = read_latest_version_hint(object_store, base).await else {
        return Ok(None);
    };
    let Some(mut latest) =
        head_manifest(object_store, base, hinted, ManifestNamingScheme::V2).await?
    else {
        return Ok(None);
    };
    while let Some(next) =
        head_manifest(object_store, base, latest.version + 1, ManifestNamingScheme::V2).await?
    {
        latest = next;
    }
    Ok(Some(latest))
}

/// Get the latest manifest location
async fn current_manifest_path(
    object_store: &ObjectStore,
    base: &Path,
) -> Result<ManifestLocation> {
    if let Some(location) = current_manifest_from_hint(object_store, base).await? {
        return Ok(location);
    }

    // We use `list_with_delimiter` to avoid listing the contents of child directories.
    let manifest_files = object_store
        .inner
        .list_with_delimiter(Some(&base.child(VERSIONS_DIR)))
        .await?;

    let current = manifest_files
        .objects
        .into_iter()
        .filter_map(|meta| {
            let filename = meta.location.filename()?;
            let scheme = ManifestNamingScheme::detect_scheme(filename)?;
            let version = scheme.parse_version(filename)?;
            Some(ManifestLocation {
                version,
                size: Some(meta.size),
                path: meta.location,
                naming_scheme: scheme,
            })
        })
        .max_by_key(|location| location.version);

    current.ok_or_else(|| Error::NotFound {
        uri: ManifestNamingScheme::V1.manifest_path(base, 1).to_string(),
        location: location!(),
    })
}

/// Resolve the location of one version, in whichever scheme it was written.
async fn default_resolve_version(
    base_path: &Path,
    version: u64,
    object_store: &ObjectStore,
) -> Result<ManifestLocation> {
    // Detached paths do not depend on the scheme.
    let schemes = if is_detached_version(version) {
        &[ManifestNamingScheme::V2][..]
    } else {
        &[ManifestNamingScheme::V2, ManifestNamingScheme::V1][..]
    };
    for scheme in schemes {
        if let Some(location) = head_manifest(object_store, base_path, version, *scheme).await? {
            return Ok(location);
        }
    }
    Err(Error::NotFound {
        uri: ManifestNamingScheme::V1
            .manifest_path(base_path, version)
            .to_string(),
        location: location!(),
    })
}

fn list_manifests<'a>(
    base_path: &Path,
    object_store: &'a ObjectStore,
) -> BoxStream<'a, Result<ManifestLocation>> {
    object_store
        .list(Some(base_path.child(VERSIONS_DIR)))
        .try_filter_map(|meta| {
            let location = meta.location.filename().and_then(|filename| {
                let scheme = ManifestNamingScheme::detect_scheme(filename)?;
                let version = scheme.parse_version(filename)?;
                Some(ManifestLocation {
                    version,
                    path: meta.location.clone(),
                    size: Some(meta.size),
                    naming_scheme: scheme,
                })
            });
            future::ready(Ok(location))
        })
        .boxed()
}

/// Handle commits that prevent conflicting writes.
///
/// Commit implementations ensure that if there are multiple concurrent writers
/// attempting to write the next version of a table, only one will win. In order
/// to work, all writers must use the same commit handler type.
/// This trait is also responsible for resolving where the manifests live.
#[async_trait::async_trait]
pub trait CommitHandler: Debug + Send + Sync {
    /// Get the location of the latest version manifest of a dataset at the base_path
    async fn resolve_latest_location(
        &self,
        base_path: &Path,
        object_store: &ObjectStore,
    ) -> Result<ManifestLocation> {
        current_manifest_path(object_store, base_path).await
    }

    /// Get the location of a specific versioned manifest of a dataset at the base_path
    async fn resolve_version_location(
        &self,
        base_path: &Path,
        version: u64,
        object_store: &ObjectStore,
    ) -> Result<ManifestLocation> {
        default_resolve_version(base_path, version, object_store).await
    }

    /// List manifests that are available for a dataset at the base_path.
    ///
    /// Detached manifests are not listed. The order is unspecified.
    fn list_manifest_locations<'a>(
        &self,
        base_path: &Path,
        object_store: &'a ObjectStore,
    ) -> BoxStream<'a, Result<ManifestLocation>> {
        list_manifests(base_path, object_store)
    }

    /// Commit a manifest.
    ///
    /// This function should return an [CommitError::CommitConflict] if another
    /// transaction has already been committed to the path.
    async fn commit(
        &self,
        manifest: &Manifest,
        base_path: &Path,
        object_store: &ObjectStore,
        naming_scheme: ManifestNamingScheme,
    ) -> std::result::Result<ManifestLocation, CommitError>;
}

/// Pick the commit handler for a dataset location.
pub fn commit_handler_from_url(url_or_path: &str) -> Result<Arc<dyn CommitHandler>> {
    let url = match Url::parse(url_or_path) {
        Ok(url) if url.scheme().len() == 1 && cfg!(windows) => {
            // On Windows, the drive is parsed as a scheme
            return Ok(Arc::new(ConditionalPutCommitHandler));
        }
        Ok(url) => url,
        Err(_) => {
            return Ok(Arc::new(ConditionalPutCommitHandler));
        }
    };

    match url.scheme() {
        "file" | "file-object-store" | "memory" => Ok(Arc::new(ConditionalPutCommitHandler)),
        unknown_scheme => Err(Error::not_supported(
            format!("Unsupported URI scheme: {}", unknown_scheme),
            location!(),
        )),
    }
}

/// Errors that can occur when committing a manifest.
#[derive(Debug)]
pub enum CommitError {
    /// Another transaction has already been written to the path
    CommitConflict,
    /// Something else went wrong
    OtherError(Error),
}

impl From<Error> for CommitError {
    fn from(e: Error) -> Self {
        Self::OtherError(e)
    }
}

impl From<CommitError> for Error {
    fn from(e: CommitError) -> Self {
        match e {
            CommitError::CommitConflict => Self::Internal {
                message: "Commit conflict".to_string(),
                location: location!(),
            },
            CommitError::OtherError(e) => e,
        }
    }
}

async fn finish_commit(
    object_store: &ObjectStore,
    base_path: &Path,
    manifest: &Manifest,
    path: Path,
    size: u64,
    naming_scheme: ManifestNamingScheme,
) -> ManifestLocation {
    if naming_scheme == ManifestNamingScheme::V2 && !manifest.is_detached() {
        write_latest_version_hint(object_store, base_path, manifest.version).await;
    }
    ManifestLocation {
        version: manifest.version,
        path,
        size: Some(size),
        naming_scheme,
    }
}

/// A commit implementation that claims the version slot with a conditional put.
///
/// This requires an object store that supports [`PutMode::Create`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ConditionalPutCommitHandler;

#[async_trait::async_trait]
impl CommitHandler for ConditionalPutCommitHandler {
    #[instrument(level = "debug", skip_all, fields(version = manifest.version))]
    async fn commit(
        &self,
        manifest: &Manifest,
        base_path: &Path,
        object_store: &ObjectStore,
        naming_scheme: ManifestNamingScheme,
    ) -> std::result::Result<ManifestLocation, CommitError> {
        let path = naming_scheme.manifest_path(base_path, manifest.version);
        let bytes = manifest_to_bytes(manifest)?;
        let size = bytes.len() as u64;

        match object_store
            .inner
            .put_opts(&path, PutPayload::from(bytes), PutMode::Create.into())
            .await
        {
            Ok(_) => {}
            Err(ObjectStoreError::AlreadyExists { .. }) => {
                return Err(CommitError::CommitConflict);
            }
            Err(e) => return Err(CommitError::OtherError(e.into())),
        }

        Ok(finish_commit(object_store, base_path, manifest, path, size, naming_scheme).await)
    }
}

/// Whether we have issued a warning about using the unsafe commit handler.
static WARNED_ON_UNSAFE_COMMIT: AtomicBool = AtomicBool::new(false);

/// A naive commit implementation that does not prevent conflicting writes.
///
/// This will log a warning the first time it is used.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsafeCommitHandler;

#[async_trait::async_trait]
impl CommitHandler for UnsafeCommitHandler {
    #[instrument(level = "debug", skip_all, fields(version = manifest.version))]
    async fn commit(
        &self,
        manifest: &Manifest,
        base_path: &Path,
        object_store: &ObjectStore,
        naming_scheme: ManifestNamingScheme,
    ) -> std::result::Result<ManifestLocation, CommitError> {
        // Log a one-time warning
        if !WARNED_ON_UNSAFE_COMMIT.load(std::sync::atomic::Ordering::Relaxed) {
            WARNED_ON_UNSAFE_COMMIT.store(true, std::sync::atomic::Ordering::Relaxed);
            log::warn!(
                "Using unsafe commit handler. Concurrent writes may result in data loss. \
                 Consider providing a commit handler that prevents conflicting writes."
            );
        }

        let path = naming_scheme.manifest_path(base_path, manifest.version);
        let bytes = manifest_to_bytes(manifest)?;
        let size = bytes.len() as u64;
        // Write the manifest naively
        object_store.put(&path, bytes).await?;

        Ok(finish_commit(object_store, base_path, manifest, path, size, naming_scheme).await)
    }
}

/// A commit implementation that uses a lock to prevent conflicting writes.
#[async_trait::async_trait]
pub trait CommitLock: Debug {
    type Lease: CommitLease;

    /// Attempt to lock the table for the given version.
    ///
    /// If it is already locked by another transaction, wait until it is unlocked.
    /// Once it is unlocked, return [CommitError::CommitConflict] if the version
    /// has already been committed. Otherwise, return the lock.
    ///
    /// It is not required that the lock tracks the version. It is provided in
    /// case the locking is handled by a catalog service that needs to know the
    /// current version of the table.
    async fn lock(&self, version: u64) -> std::result::Result<Self::Lease, CommitError>;
}

#[async_trait::async_trait]
pub trait CommitLease: Send + Sync {
    /// Return the lease, indicating whether the commit was successful.
    async fn release(&self, success: bool) -> std::result::Result<(), CommitError>;
}

#[async_trait::async_trait]
impl<T: CommitLock + Send + Sync> CommitHandler for T {
    #[instrument(level = "debug", skip_all, fields(version = manifest.version))]
    async fn commit(
        &self,
        manifest: &Manifest,
        base_path: &Path,
        object_store: &ObjectStore,
        naming_scheme: ManifestNamingScheme,
    ) -> std::result::Result<ManifestLocation, CommitError> {
        let path = naming_scheme.manifest_path(base_path, manifest.version);
        let bytes = manifest_to_bytes(manifest)?;
        let size = bytes.len() as u64;
        // NOTE: once we have the lease we cannot use ? to return errors, since
        // we must release the lease before returning.
        let lease = self.lock(manifest.version).await?;

        // Head the location and make sure it's not already committed
        match object_store.inner.head(&path).await {
            Ok(_) => {
                // The path already exists, so it's already committed
                lease.release(false).await?;
                return Err(CommitError::CommitConflict);
            }
            Err(ObjectStoreError::NotFound { .. }) => {}
            Err(e) => {
                lease.release(false).await?;
                return Err(CommitError::OtherError(e.into()));
            }
        }
        let res = object_store.put(&path, bytes).await;

        lease.release(res.is_ok()).await?;
        res?;

        Ok(finish_commit(object_store, base_path, manifest, path, size, naming_scheme).await)
    }
}

/// A commit implementation that uses a temporary path and renames the object.
///
/// This only works for object stores that support atomic rename if not exist.
#[derive(Debug, Default, Clone, Copy)]
pub struct RenameCommitHandler;

#[async_trait::async_trait]
impl CommitHandler for RenameCommitHandler {
    #[instrument(level = "debug", skip_all, fields(version = manifest.version))]
    async fn commit(
        &self,
        manifest: &Manifest,
        base_path: &Path,
        object_store: &ObjectStore,
        naming_scheme: ManifestNamingScheme,
    ) -> std::result::Result<ManifestLocation, CommitError> {
        // Create a temporary object, then use `rename_if_not_exists` to commit.
        // If failed, clean up the temporary object.
        let path = naming_scheme.manifest_path(base_path, manifest.version);
        let filename = path.filename().unwrap_or(MANIFEST_EXTENSION);
        // Add a UUID to the end of the filename to avoid conflicts
        let tmp_path = base_path.child(VERSIONS_DIR).child(format!(
            ".tmp_{}_{}",
            filename,
            uuid::Uuid::new_v4().as_hyphenated()
        ));

        let bytes = manifest_to_bytes(manifest)?;
        let size = bytes.len() as u64;
        object_store.put(&tmp_path, bytes).await?;

        match object_store
            .inner
            .rename_if_not_exists(&tmp_path, &path)
            .await
        {
            Ok(_) => {}
            Err(ObjectStoreError::AlreadyExists { .. }) => {
                // Another transaction has already been committed
                // Attempt to clean up temporary object, but ignore errors if we can't
                let _ = object_store.delete(&tmp_path).await;
                return Err(CommitError::CommitConflict);
            }
            Err(e) => {
                let _ = object_store.delete(&tmp_path).await;
                return Err(CommitError::OtherError(e.into()));
            }
        }

        Ok(finish_commit(object_store, base_path, manifest, path, size, naming_scheme).await)
    }
}

/// Configuration of the commit loop.
#[derive(Debug, Clone, Default)]
pub struct CommitConfig {
    /// How many times a commit that lost the race for a version is retried.
    pub num_retries: u32,
    /// Skip the cleanup that runs after a commit when the dataset enables it.
    pub skip_auto_cleanup: bool,
}
