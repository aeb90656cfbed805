// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Trait for commit implementations.
//!
//! In order to provide the atomic commits, the storage layer must provide a
//! way to atomically claim the next version slot. A transaction is first
//! checked against every transaction committed after its read version, then
//! turned into a manifest on top of the latest one and handed to a
//! [`CommitHandler`]. If another writer claimed the slot first the loop
//! backs off and tries again, up to [`CommitConfig::num_retries`] times.

use std::sync::Arc;
use std::time::Instant;

use object_store::path::Path;
use rand::{rng, Rng};
use snafu::location;
use tracing::instrument;
use vellum_core::utils::backoff::{Backoff, SlotBackoff};
use vellum_core::{Error, Result};
use vellum_io::object_store::ObjectStore;
use vellum_table::format::{
    is_detached_version, Manifest, DETACHED_VERSION_MASK, TRANSACTIONS_DIR, TRANSACTION_EXTENSION,
};
use vellum_table::io::commit::{
    CommitConfig, CommitError, CommitHandler, ManifestLocation, ManifestNamingScheme,
};

use crate::dataset::cleanup::auto_cleanup_hook;
use crate::dataset::transaction::{Operation, Transaction};
use crate::dataset::{write_manifest_file, Dataset, ManifestWriteConfig};

pub mod conflict_resolver;

use conflict_resolver::ConflictResolver;

/// Read the transaction data from a transaction file.
pub(crate) async fn read_transaction_file(
    object_store: &ObjectStore,
    base_path: &Path,
    transaction_file: &str,
) -> Result<Transaction> {
    let path = base_path.child(TRANSACTIONS_DIR).child(transaction_file);
    let data = object_store.read_one_all(&path).await?;
    serde_json::from_slice(&data).map_err(|e| {
        Error::corrupt_file(
            path,
            format!("failed to decode transaction: {}", e),
            location!(),
        )
    })
}

/// Write a transaction to a file and return the relative path.
async fn write_transaction_file(
    object_store: &ObjectStore,
    base_path: &Path,
    transaction: &Transaction,
) -> Result<String> {
    let file_name = format!(
        "{}-{}.{}",
        transaction.read_version, transaction.uuid, TRANSACTION_EXTENSION
    );
    let path = base_path.child(TRANSACTIONS_DIR).child(file_name.as_str());

    let buf = serde_json::to_vec(transaction)?;
    object_store.put(&path, buf).await?;

    Ok(file_name)
}

/// Create the first version of a dataset.
pub(crate) async fn commit_new_dataset(
    object_store: &ObjectStore,
    commit_handler: &dyn CommitHandler,
    base_path: &Path,
    transaction: &Transaction,
    write_config: &ManifestWriteConfig,
    manifest_naming_scheme: ManifestNamingScheme,
) -> Result<(Manifest, ManifestLocation)> {
    let transaction_file = write_transaction_file(object_store, base_path, transaction).await?;

    let mut manifest = transaction.build_manifest(None, &transaction_file, write_config)?;

    let result = write_manifest_file(
        object_store,
        commit_handler,
        base_path,
        &mut manifest,
        write_config,
        manifest_naming_scheme,
    )
    .await;

    match result {
        Ok(manifest_location) => Ok((manifest, manifest_location)),
        Err(CommitError::CommitConflict) => Err(Error::DatasetAlreadyExists {
            uri: base_path.to_string(),
            location: location!(),
        }),
        Err(CommitError::OtherError(err)) => Err(err),
    }
}

/// Build the manifest `transaction` produces on top of `dataset`.
async fn build_manifest_for(
    dataset: &Dataset,
    object_store: &ObjectStore,
    commit_handler: &dyn CommitHandler,
    transaction: &Transaction,
    write_config: &ManifestWriteConfig,
    transaction_file: &str,
) -> Result<Manifest> {
    match transaction.operation {
        Operation::Restore { version } => {
            Transaction::restore_old_manifest(
                object_store,
                commit_handler,
                &dataset.base,
                version,
                write_config,
                transaction_file,
            )
            .await
        }
        _ => transaction.build_manifest(
            Some(dataset.manifest.as_ref()),
            transaction_file,
            write_config,
        ),
    }
}

/// Commit a transaction to a detached version.
///
/// Detached versions are never checked for conflicts and never become the
/// latest version. They are numbered with a random u64 that has
/// [`DETACHED_VERSION_MASK`] set.
pub(crate) async fn commit_detached_transaction(
    dataset: &Dataset,
    object_store: &ObjectStore,
    commit_handler: &dyn CommitHandler,
    transaction: &Transaction,
    write_config: &ManifestWriteConfig,
    commit_config: &CommitConfig,
) -> Result<(Manifest, ManifestLocation)> {
    // Kept for record-keeping even though nothing checks against it.
    let transaction_file = write_transaction_file(object_store, &dataset.base, transaction).await?;

    // The random version may already be taken, so this still loops.
    let mut backoff = Backoff::default();
    while backoff.attempt() <= commit_config.num_retries {
        let random_version = rng().random::<u64>() | DETACHED_VERSION_MASK;

        let mut manifest = build_manifest_for(
            dataset,
            object_store,
            commit_handler,
            transaction,
            write_config,
            &transaction_file,
        )
        .await?;
        manifest.version = random_version;

        let result = write_manifest_file(
            object_store,
            commit_handler,
            &dataset.base,
            &mut manifest,
            write_config,
            ManifestNamingScheme::V2,
        )
        .await;

        match result {
            Ok(location) => {
                return Ok((manifest, location));
            }
            Err(CommitError::CommitConflict) => {
                tokio::time::sleep(backoff.next_backoff()).await;
            }
            Err(CommitError::OtherError(err)) => {
                return Err(err);
            }
        }
    }

    // Running out of random versions points at a broken random source.
    Err(Error::RetryableCommitConflict {
        version: 0,
        source: format!(
            "Failed find unused random u64 after {} retries.",
            commit_config.num_retries
        )
        .into(),
        location: location!(),
    })
}

/// Attempt to commit a transaction, with retries and conflict resolution.
///
/// Returns the committed manifest and where it was written.
#[instrument(level = "debug", skip_all, fields(read_version = transaction.read_version, operation = %transaction.operation))]
pub(crate) async fn commit_transaction(
    dataset: &Dataset,
    object_store: &ObjectStore,
    commit_handler: &dyn CommitHandler,
    transaction: &Transaction,
    write_config: &ManifestWriteConfig,
    commit_config: &CommitConfig,
    manifest_naming_scheme: ManifestNamingScheme,
) -> Result<(Manifest, ManifestLocation)> {
    let read_version = transaction.read_version;
    let latest_version = dataset.latest_version_id().await?;
    if read_version > latest_version {
        return Err(Error::InvalidReadVersion {
            read_version,
            latest_version,
            location: location!(),
        });
    }

    // A read version of 0 means the transaction was built without reading the
    // dataset, so it applies to whatever version was loaded.
    let mut dataset = if read_version != 0 && dataset.manifest.version != read_version {
        dataset.checkout_version(read_version).await?
    } else {
        dataset.clone()
    };

    let resolver = ConflictResolver::new(transaction);
    let num_attempts = commit_config.num_retries + 1;
    let mut backoff = SlotBackoff::default();
    let start = Instant::now();

    while backoff.attempt() < num_attempts {
        // Always look for transactions we raced with, even on the first
        // attempt, so sequential and concurrent writers take the same path.
        let other_transactions: Vec<(u64, Arc<Transaction>)>;
        (dataset, other_transactions) = dataset.load_new_transactions().await?;
        for (other_version, other_transaction) in other_transactions.iter() {
            resolver.check_txn(other_transaction, *other_version)?;
        }

        let transaction_file =
            write_transaction_file(object_store, &dataset.base, transaction).await?;

        let target_version = dataset.manifest.version + 1;
        if is_detached_version(target_version) {
            return Err(Error::internal(
                "more than 2^63 versions have been created and so regular version numbers are appearing as 'detached' versions.",
                location!(),
            ));
        }

        let mut manifest = build_manifest_for(
            &dataset,
            object_store,
            commit_handler,
            transaction,
            write_config,
            &transaction_file,
        )
        .await?;
        manifest.version = target_version;

        let result = write_manifest_file(
            object_store,
            commit_handler,
            &dataset.base,
            &mut manifest,
            write_config,
            manifest_naming_scheme,
        )
        .await;

        match result {
            Ok(manifest_location) => {
                if !commit_config.skip_auto_cleanup {
                    let committed = Dataset::checkout_manifest(
                        dataset.object_store.clone(),
                        dataset.base.clone(),
                        dataset.uri().to_owned(),
                        manifest.clone(),
                        manifest_location.clone(),
                        dataset.commit_handler.clone(),
                    );
                    match auto_cleanup_hook(&committed, &manifest).await {
                        Ok(Some(stats)) => log::info!("Auto cleanup triggered: {:?}", stats),
                        Err(e) => log::error!("Error encountered during auto_cleanup_hook: {}", e),
                        _ => {}
                    };
                }
                return Ok((manifest, manifest_location));
            }
            Err(CommitError::CommitConflict) => {
                let next_attempt_i = backoff.attempt() + 1;

                if backoff.attempt() == 0 {
                    // The first attempt's duration, plus 10%, is the width of
                    // one backoff slot.
                    backoff = backoff.with_unit((start.elapsed().as_millis() * 11 / 10) as u32);
                }

                if next_attempt_i < num_attempts {
                    let wait = backoff.next_backoff();
                    log::info!(
                        "Lost the race for version {}, retrying in {:?} (attempt {} of {})",
                        target_version,
                        wait,
                        next_attempt_i + 1,
                        num_attempts
                    );
                    tokio::time::sleep(wait).await;
                    continue;
                } else {
                    break;
                }
            }
            Err(CommitError::OtherError(err)) => {
                return Err(err);
            }
        }
    }

    Err(Error::RetryableCommitConflict {
        version: dataset.manifest.version,
        source: format!(
            "Failed to commit the transaction on top of version {} after {} retries.",
            dataset.manifest.version, commit_config.num_retries
        )
        .into(),
        location: location!(),
    })
}
