// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Transaction definitions for updating datasets
//!
//! Prior to creating a new manifest, a transaction must be created representing
//! the changes being made to the dataset. By representing them as incremental
//! changes, we can detect whether concurrent operations are compatible with
//! one another (see [`crate::io::commit::conflict_resolver`]). We can also
//! rebuild manifests when retrying committing a manifest.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use object_store::path::Path;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use snafu::location;
use uuid::Uuid;
use vellum_core::datatypes::Schema;
use vellum_core::{Error, Result};
use vellum_io::object_store::ObjectStore;
use vellum_table::feature_flags::apply_feature_flags;
use vellum_table::format::{
    DataStorageFormat, FileVersion, Fragment, IndexMetadata, Manifest, RowIdMeta,
};
use vellum_table::io::commit::CommitHandler;
use vellum_table::io::manifest::read_manifest;

use super::{Dataset, ManifestWriteConfig};
use crate::utils::temporal::timestamp_to_nanos;

/// A change to a dataset that can be retried
///
/// This contains enough information to be able to build the next manifest,
/// given the current manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// The version of the table this transaction is based off of. If this is
    /// the first transaction, this should be 0.
    pub read_version: u64,
    pub uuid: String,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Free-form properties recorded alongside the commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_properties: Option<HashMap<String, String>>,
}

/// An operation on a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Operation {
    /// Adding new fragments to the dataset. The fragments contained within
    /// haven't yet been assigned a final ID.
    Append { fragments: Vec<Fragment> },
    /// Updated fragments contain those that have been modified with new deletion
    /// files. The deleted fragment IDs are those that should be removed from
    /// the manifest.
    Delete {
        updated_fragments: Vec<Fragment>,
        deleted_fragment_ids: Vec<u64>,
        predicate: String,
    },
    /// Overwrite the entire dataset with the given fragments. This is also
    /// used when initially creating a table.
    Overwrite {
        fragments: Vec<Fragment>,
        schema: Schema,
        config_upsert_values: Option<HashMap<String, String>>,
    },
    /// A new index has been created.
    CreateIndex {
        /// The new secondary indices that are being added
        new_indices: Vec<IndexMetadata>,
        /// The indices that have been modified.
        removed_indices: Vec<IndexMetadata>,
    },
    /// Data is rewritten but *not* modified. This is used for things like
    /// compaction or re-ordering. Contains the old fragments and the new
    /// ones that have been replaced.
    ///
    /// This operation will modify the row addresses of existing rows and
    /// so any existing index covering a rewritten fragment will need to be
    /// remapped.
    Rewrite {
        /// Groups of fragments that have been modified
        groups: Vec<RewriteGroup>,
        /// Indices that have been updated with the new row addresses
        rewritten_indices: Vec<RewrittenIndex>,
    },
    /// Merge a new column in
    Merge {
        fragments: Vec<Fragment>,
        schema: Schema,
    },
    /// Restore an old version of the database
    Restore { version: u64 },
    /// Reserves fragment ids for future use
    /// This can be used when row ids need to be known before a transaction
    /// has been committed.
    ReserveFragments { num_fragments: u32 },
    /// Update values in the dataset.
    Update {
        /// Ids of fragments that have been moved
        removed_fragment_ids: Vec<u64>,
        /// Fragments that have been updated
        updated_fragments: Vec<Fragment>,
        /// Fragments that have been added
        new_fragments: Vec<Fragment>,
    },
    /// Project to a new schema. This only changes the schema, not the data.
    Project { schema: Schema },
    /// Update the dataset configuration.
    UpdateConfig {
        upsert_values: Option<HashMap<String, String>>,
        delete_keys: Option<Vec<String>>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewrittenIndex {
    pub old_id: Uuid,
    pub new_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewriteGroup {
    pub old_fragments: Vec<Fragment>,
    pub new_fragments: Vec<Fragment>,
}

impl Operation {
    /// Returns the IDs of fragments that have been modified by this operation.
    ///
    /// This does not include new fragments.
    pub(crate) fn modified_fragment_ids(&self) -> Box<dyn Iterator<Item = u64> + '_> {
        match self {
            // These operations add new fragments or don't modify any.
            Self::Append { .. }
            | Self::Overwrite { .. }
            | Self::CreateIndex { .. }
            | Self::ReserveFragments { .. }
            | Self::Project { .. }
            | Self::UpdateConfig { .. }
            | Self::Restore { .. } => Box::new(std::iter::empty()),
            Self::Delete {
                updated_fragments,
                deleted_fragment_ids,
                ..
            } => Box::new(
                updated_fragments
                    .iter()
                    .map(|f| f.id)
                    .chain(deleted_fragment_ids.iter().copied()),
            ),
            Self::Rewrite { groups, .. } => Box::new(
                groups
                    .iter()
                    .flat_map(|f| f.old_fragments.iter().map(|f| f.id)),
            ),
            Self::Merge { fragments, .. } => Box::new(fragments.iter().map(|f| f.id)),
            Self::Update {
                updated_fragments,
                removed_fragment_ids,
                ..
            } => Box::new(
                updated_fragments
                    .iter()
                    .map(|f| f.id)
                    .chain(removed_fragment_ids.iter().copied()),
            ),
        }
    }

    /// Returns the config keys that have been upserted by this operation.
    fn get_upsert_config_keys(&self) -> Vec<&str> {
        match self {
            Self::Overwrite {
                config_upsert_values: Some(upsert_values),
                ..
            }
            | Self::UpdateConfig {
                upsert_values: Some(upsert_values),
                ..
            } => upsert_values.keys().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Returns the config keys that have been deleted by this operation.
    fn get_delete_config_keys(&self) -> Vec<&str> {
        match self {
            Self::UpdateConfig {
                delete_keys: Some(dk),
                ..
            } => dk.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Check whether another operation modifies the same fragment IDs as this one.
    pub(crate) fn modifies_same_ids(&self, other: &Self) -> bool {
        let self_ids = self.modified_fragment_ids().collect::<HashSet<_>>();
        let mut other_ids = other.modified_fragment_ids();
        other_ids.any(|id| self_ids.contains(&id))
    }

    /// Check whether either operation upserts a key that the other one references.
    pub(crate) fn upsert_key_conflict(&self, other: &Self) -> bool {
        let self_upsert_keys = self.get_upsert_config_keys();
        let other_upsert_keys = other.get_upsert_config_keys();

        let self_delete_keys = self.get_delete_config_keys();
        let other_delete_keys = other.get_delete_config_keys();

        self_upsert_keys
            .iter()
            .any(|x| other_upsert_keys.contains(x) || other_delete_keys.contains(x))
            || other_upsert_keys
                .iter()
                .any(|x| self_upsert_keys.contains(x) || self_delete_keys.contains(x))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Append { .. } => "Append",
            Self::Delete { .. } => "Delete",
            Self::Overwrite { .. } => "Overwrite",
            Self::CreateIndex { .. } => "CreateIndex",
            Self::Rewrite { .. } => "Rewrite",
            Self::Merge { .. } => "Merge",
            Self::ReserveFragments { .. } => "ReserveFragments",
            Self::Restore { .. } => "Restore",
            Self::Update { .. } => "Update",
            Self::Project { .. } => "Project",
            Self::UpdateConfig { .. } => "UpdateConfig",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Builds a [`Transaction`].
///
/// Exactly one operation must be set. Mistakes are reported by [`Self::build`]
/// so that calls can be chained.
#[derive(Debug, Clone, Default)]
pub struct TransactionBuilder {
    read_version: u64,
    uuid: Option<String>,
    operation: Option<Operation>,
    tag: Option<String>,
    transaction_properties: Option<HashMap<String, String>>,
    error: Option<String>,
}

impl TransactionBuilder {
    /// Start a transaction based on `read_version`.
    ///
    /// Use 0 when creating a new dataset.
    pub fn new(read_version: u64) -> Self {
        Self {
            read_version,
            ..Default::default()
        }
    }

    /// Start a transaction based on the checked out version of `dataset`.
    pub fn from_dataset(dataset: &Dataset) -> Self {
        Self::new(dataset.manifest.version)
    }

    pub fn operation(mut self, operation: Operation) -> Self {
        match &self.operation {
            Some(existing) => {
                self.error
                    .get_or_insert_with(|| format!("Operation {} has already been set", existing));
            }
            None => self.operation = Some(operation),
        }
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn transaction_properties(mut self, properties: HashMap<String, String>) -> Self {
        self.transaction_properties = Some(properties);
        self
    }

    /// Use a caller supplied id instead of a random one.
    pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn build(self) -> Result<Transaction> {
        if let Some(error) = self.error {
            return Err(Error::invalid_input(error, location!()));
        }
        let Some(operation) = self.operation else {
            return Err(Error::invalid_input(
                "TransactionBuilder has no operations",
                location!(),
            ));
        };
        Ok(Transaction {
            read_version: self.read_version,
            uuid: self
                .uuid
                .unwrap_or_else(|| Uuid::new_v4().hyphenated().to_string()),
            operation,
            tag: self.tag,
            transaction_properties: self.transaction_properties,
        })
    }
}

impl Transaction {
    pub fn new(read_version: u64, operation: Operation, tag: Option<String>) -> Self {
        let uuid = Uuid::new_v4().hyphenated().to_string();
        Self {
            read_version,
            uuid,
            operation,
            tag,
            transaction_properties: None,
        }
    }

    fn fragments_with_ids<'a, T>(
        new_fragments: T,
        fragment_id: &'a mut u64,
    ) -> impl Iterator<Item = Fragment> + 'a
    where
        T: IntoIterator<Item = Fragment> + 'a,
    {
        new_fragments.into_iter().map(move |mut f| {
            if f.id == 0 {
                f.id = *fragment_id;
                *fragment_id += 1;
            }
            f
        })
    }

    fn data_storage_format_from_files(
        fragments: &[Fragment],
        user_requested: Option<FileVersion>,
    ) -> Result<DataStorageFormat> {
        if let Some(file_version) = Fragment::try_infer_version(fragments)? {
            // Ensure user-requested matches data files
            if let Some(user_requested) = user_requested {
                if user_requested.resolve() != file_version.resolve() {
                    return Err(Error::invalid_input(
                        format!(
                            "User requested data storage version ({}) does not match version in data files ({})",
                            user_requested, file_version
                        ),
                        location!(),
                    ));
                }
            }
            Ok(DataStorageFormat::new(file_version))
        } else {
            // If no files use user-requested or default
            Ok(user_requested
                .map(DataStorageFormat::new)
                .unwrap_or_default())
        }
    }

    pub(crate) async fn restore_old_manifest(
        object_store: &ObjectStore,
        commit_handler: &dyn CommitHandler,
        base_path: &Path,
        version: u64,
        config: &ManifestWriteConfig,
        tx_path: &str,
    ) -> Result<Manifest> {
        let location = commit_handler
            .resolve_version_location(base_path, version, object_store)
            .await?;
        let mut manifest = read_manifest(object_store, &location.path).await?;
        manifest.set_timestamp(timestamp_to_nanos(config.timestamp));
        manifest.transaction_file = Some(tx_path.to_string());
        Ok(manifest)
    }

    /// Create a new manifest from the current manifest and the transaction.
    ///
    /// `current_manifest` should only be None if the dataset does not yet exist.
    pub(crate) fn build_manifest(
        &self,
        current_manifest: Option<&Manifest>,
        transaction_file_path: &str,
        config: &ManifestWriteConfig,
    ) -> Result<Manifest> {
        if config.use_stable_row_ids
            && current_manifest
                .map(|m| !m.uses_stable_row_ids())
                .unwrap_or_default()
        {
            return Err(Error::not_supported(
                "Cannot enable stable row ids on existing dataset",
                location!(),
            ));
        }

        // Get the schema and the final fragment list
        let schema = match self.operation {
            Operation::Overwrite { ref schema, .. } => schema.clone(),
            Operation::Merge { ref schema, .. } => schema.clone(),
            Operation::Project { ref schema, .. } => schema.clone(),
            _ => {
                if let Some(current_manifest) = current_manifest {
                    current_manifest.schema.clone()
                } else {
                    return Err(Error::internal(
                        "Cannot create a new dataset without a schema",
                        location!(),
                    ));
                }
            }
        };

        let mut fragment_id = if matches!(self.operation, Operation::Overwrite { .. }) {
            0
        } else {
            current_manifest
                .and_then(|m| m.max_fragment_id())
                .map(|id| id + 1)
                .unwrap_or(0)
        };
        let mut final_fragments = Vec::new();
        let mut final_indices = current_manifest
            .map(|m| m.indices.clone())
            .unwrap_or_default();

        // Only use row ids if the feature flag is set already or this is a new dataset.
        let mut next_row_id = match current_manifest {
            Some(manifest) if manifest.uses_stable_row_ids() => Some(manifest.next_row_id),
            None if config.use_stable_row_ids => Some(0),
            _ => None,
        };

        let maybe_existing_fragments = current_manifest
            .map(|m| m.fragments.as_ref())
            .ok_or_else(|| {
                Error::internal(
                    format!(
                        "No current manifest was provided while building manifest for operation {}",
                        self.operation.name()
                    ),
                    location!(),
                )
            });

        match &self.operation {
            Operation::Append { ref fragments } => {
                final_fragments.extend(maybe_existing_fragments?.clone());
                let mut new_fragments =
                    Self::fragments_with_ids(fragments.clone(), &mut fragment_id)
                        .collect::<Vec<_>>();
                if let Some(next_row_id) = &mut next_row_id {
                    Self::assign_row_ids(next_row_id, new_fragments.as_mut_slice())?;
                }
                final_fragments.extend(new_fragments);
            }
            Operation::Delete {
                ref updated_fragments,
                ref deleted_fragment_ids,
                ..
            } => {
                // Remove the deleted fragments
                final_fragments.extend(maybe_existing_fragments?.clone());
                final_fragments.retain(|f| !deleted_fragment_ids.contains(&f.id));
                final_fragments.iter_mut().for_each(|f| {
                    for updated in updated_fragments {
                        if updated.id == f.id {
                            *f = updated.clone();
                        }
                    }
                });
                Self::retain_relevant_indices(&mut final_indices, &schema, &final_fragments)
            }
            Operation::Update {
                removed_fragment_ids,
                updated_fragments,
                new_fragments,
            } => {
                final_fragments.extend(maybe_existing_fragments?.iter().filter_map(|f| {
                    if removed_fragment_ids.contains(&f.id) {
                        return None;
                    }
                    if let Some(updated) = updated_fragments.iter().find(|uf| uf.id == f.id) {
                        Some(updated.clone())
                    } else {
                        Some(f.clone())
                    }
                }));
                let mut new_fragments =
                    Self::fragments_with_ids(new_fragments.clone(), &mut fragment_id)
                        .collect::<Vec<_>>();
                if let Some(next_row_id) = &mut next_row_id {
                    Self::assign_row_ids(next_row_id, new_fragments.as_mut_slice())?;
                }
                final_fragments.extend(new_fragments);
                Self::retain_relevant_indices(&mut final_indices, &schema, &final_fragments)
            }
            Operation::Overwrite { ref fragments, .. } => {
                let mut new_fragments =
                    Self::fragments_with_ids(fragments.clone(), &mut fragment_id)
                        .collect::<Vec<_>>();
                if let Some(next_row_id) = &mut next_row_id {
                    Self::assign_row_ids(next_row_id, new_fragments.as_mut_slice())?;
                }
                final_fragments.extend(new_fragments);
                final_indices = Vec::new();
            }
            Operation::Rewrite {
                ref groups,
                ref rewritten_indices,
            } => {
                final_fragments.extend(maybe_existing_fragments?.clone());
                let current_version = current_manifest.map(|m| m.version).unwrap_or_default();
                Self::handle_rewrite_fragments(
                    &mut final_fragments,
                    groups,
                    &mut fragment_id,
                    current_version,
                )?;

                if next_row_id.is_some() {
                    // Stable row ids survive a rewrite, only the bitmaps move.
                    for index in final_indices.iter_mut() {
                        if let Some(fragment_bitmap) = &mut index.fragment_bitmap {
                            *fragment_bitmap =
                                Self::recalculate_fragment_bitmap(fragment_bitmap, groups)?;
                        }
                    }
                } else {
                    Self::handle_rewrite_indices(&mut final_indices, rewritten_indices, groups)?;
                }
            }
            Operation::CreateIndex {
                new_indices,
                removed_indices,
            } => {
                final_fragments.extend(maybe_existing_fragments?.clone());
                final_indices.retain(|existing_index| {
                    !new_indices
                        .iter()
                        .any(|new_index| new_index.name == existing_index.name)
                        && !removed_indices
                            .iter()
                            .any(|old_index| old_index.uuid == existing_index.uuid)
                });
                final_indices.extend(new_indices.clone());
            }
            Operation::ReserveFragments { .. } | Operation::UpdateConfig { .. } => {
                final_fragments.extend(maybe_existing_fragments?.clone());
            }
            Operation::Merge { ref fragments, .. } => {
                final_fragments.extend(fragments.clone());

                // Some fields that have indices may have been removed, so we should
                // remove those indices as well.
                Self::retain_relevant_indices(&mut final_indices, &schema, &final_fragments)
            }
            Operation::Project { .. } => {
                final_fragments.extend(maybe_existing_fragments?.clone());

                // We might have removed all fields for certain data files, so
                // we should remove the data files that are no longer relevant.
                let remaining_field_ids = schema
                    .fields_pre_order()
                    .map(|f| f.id)
                    .collect::<HashSet<_>>();
                for fragment in final_fragments.iter_mut() {
                    fragment.files.retain(|file| {
                        file.fields
                            .iter()
                            .any(|field_id| remaining_field_ids.contains(field_id))
                    });
                }

                Self::retain_relevant_indices(&mut final_indices, &schema, &final_fragments)
            }
            Operation::Restore { .. } => {
                return Err(Error::internal(
                    "Restore replays an old manifest and cannot be built from the current one",
                    location!(),
                ));
            }
        };

        // If a fragment was reserved then it may not belong at the end of the fragments list.
        final_fragments.sort_by_key(|frag| frag.id);

        let user_requested_version = config
            .storage_format
            .as_ref()
            .map(|format| format.file_version())
            .transpose()?;

        let mut manifest = if let Some(current_manifest) = current_manifest {
            let mut prev_manifest =
                Manifest::new_from_previous(current_manifest, schema, Arc::new(final_fragments));
            if let (Some(requested), Operation::Overwrite { .. }) =
                (user_requested_version, &self.operation)
            {
                // An overwrite may switch formats. Everything else keeps the
                // format of the previous version.
                prev_manifest.data_storage_format = DataStorageFormat::new(requested);
            }
            prev_manifest
        } else {
            let data_storage_format =
                Self::data_storage_format_from_files(&final_fragments, user_requested_version)?;
            Manifest::new(schema, Arc::new(final_fragments), data_storage_format)
        };

        manifest.indices = final_indices;
        manifest.tag.clone_from(&self.tag);
        manifest.transaction_uuid = Some(self.uuid.clone());
        manifest
            .transaction_properties
            .clone_from(&self.transaction_properties);

        if config.auto_set_feature_flags {
            apply_feature_flags(&mut manifest, config.use_stable_row_ids)?;
        }
        manifest.set_timestamp(timestamp_to_nanos(config.timestamp));

        manifest.update_max_fragment_id();

        match &self.operation {
            Operation::Overwrite {
                config_upsert_values: Some(tm),
                ..
            } => manifest.update_config(tm.clone()),
            Operation::UpdateConfig {
                upsert_values,
                delete_keys,
            } => {
                // Delete is handled first. If the same key is referenced by upsert and
                // delete, then upserted key-value pair will remain.
                if let Some(delete_keys) = delete_keys {
                    manifest.delete_config_keys(
                        delete_keys
                            .iter()
                            .map(|s| s.as_str())
                            .collect::<Vec<_>>()
                            .as_slice(),
                    )
                }
                if let Some(upsert_values) = upsert_values {
                    manifest.update_config(upsert_values.clone());
                }
            }
            _ => {}
        }

        if let Operation::ReserveFragments { num_fragments } = self.operation {
            manifest.max_fragment_id = match manifest.max_fragment_id {
                Some(id) => Some(id + num_fragments),
                None => num_fragments.checked_sub(1),
            };
        }

        manifest.transaction_file = Some(transaction_file_path.to_string());

        if let Some(next_row_id) = next_row_id {
            manifest.next_row_id = next_row_id;
        }

        Ok(manifest)
    }

    fn retain_relevant_indices(
        indices: &mut Vec<IndexMetadata>,
        schema: &Schema,
        fragments: &[Fragment],
    ) {
        let field_ids = schema
            .fields_pre_order()
            .map(|f| f.id)
            .collect::<HashSet<_>>();
        indices.retain(|existing_index| {
            existing_index
                .fields
                .iter()
                .all(|field_id| field_ids.contains(field_id))
        });

        // We might have also removed all fragments that an index was covering, so
        // we should remove those indices as well.
        let fragment_ids = fragments.iter().map(|f| f.id).collect::<HashSet<_>>();
        indices.retain(|existing_index| {
            existing_index
                .fragment_bitmap
                .as_ref()
                .map(|bitmap| bitmap.iter().any(|id| fragment_ids.contains(&(id as u64))))
                .unwrap_or(true)
        });
    }

    fn recalculate_fragment_bitmap(
        old: &RoaringBitmap,
        groups: &[RewriteGroup],
    ) -> Result<RoaringBitmap> {
        let mut new_bitmap = old.clone();
        for group in groups {
            let any_in_index = group
                .old_fragments
                .iter()
                .any(|frag| old.contains(frag.id as u32));
            let all_in_index = group
                .old_fragments
                .iter()
                .all(|frag| old.contains(frag.id as u32));
            // A rewrite group must be covered by the index entirely or not at all.
            if any_in_index {
                if all_in_index {
                    for frag_id in group.old_fragments.iter().map(|frag| frag.id as u32) {
                        new_bitmap.remove(frag_id);
                    }
                    new_bitmap.extend(group.new_fragments.iter().map(|frag| frag.id as u32));
                } else {
                    return Err(Error::invalid_input(
                        "The rewrite included a group that was a split of indexed and non-indexed data",
                        location!(),
                    ));
                }
            }
        }
        Ok(new_bitmap)
    }

    fn handle_rewrite_indices(
        indices: &mut [IndexMetadata],
        rewritten_indices: &[RewrittenIndex],
        groups: &[RewriteGroup],
    ) -> Result<()> {
        let mut modified_indices = HashSet::new();

        for rewritten_index in rewritten_indices {
            if !modified_indices.insert(rewritten_index.old_id) {
                return Err(Error::invalid_input(
                    format!(
                        "Multiple rewrites modified the same index: {}",
                        rewritten_index.old_id
                    ),
                    location!(),
                ));
            }

            let index = indices
                .iter_mut()
                .find(|idx| idx.uuid == rewritten_index.old_id)
                .ok_or_else(|| {
                    Error::invalid_input(
                        format!(
                            "Rewrite refers to index {} which does not exist",
                            rewritten_index.old_id
                        ),
                        location!(),
                    )
                })?;

            index.fragment_bitmap = Some(Self::recalculate_fragment_bitmap(
                index.fragment_bitmap.as_ref().ok_or_else(|| {
                    Error::invalid_input(
                        format!(
                            "Cannot rewrite index {} which did not store fragment bitmap",
                            index.uuid
                        ),
                        location!(),
                    )
                })?,
                groups,
            )?);
            index.uuid = rewritten_index.new_id;
        }
        Ok(())
    }

    fn handle_rewrite_fragments(
        final_fragments: &mut Vec<Fragment>,
        groups: &[RewriteGroup],
        fragment_id: &mut u64,
        version: u64,
    ) -> Result<()> {
        for group in groups {
            let Some(first) = group.old_fragments.first() else {
                return Err(Error::malformed_operation(
                    "a rewrite group must replace at least one fragment",
                    location!(),
                ));
            };
            // If the old fragments are contiguous, find the range
            let replace_range = {
                let start = final_fragments
                    .iter()
                    .position(|f| f.id == first.id)
                    .ok_or_else(|| Error::RetryableCommitConflict {
                        version,
                        source: format!(
                            "dataset does not contain a fragment a rewrite operation wants to replace: id={}",
                            first.id
                        )
                        .into(),
                        location: location!(),
                    })?;

                // Verify old_fragments matches contiguous range
                let mut i = 1;
                loop {
                    if i == group.old_fragments.len() {
                        break Some(start..start + i);
                    }
                    if final_fragments
                        .get(start + i)
                        .map(|f| f.id != group.old_fragments[i].id)
                        .unwrap_or(true)
                    {
                        break None;
                    }
                    i += 1;
                }
            };

            let new_fragments = Self::fragments_with_ids(group.new_fragments.clone(), fragment_id);
            if let Some(replace_range) = replace_range {
                final_fragments.splice(replace_range, new_fragments);
            } else {
                for fragment in group.old_fragments.iter() {
                    final_fragments.retain(|f| f.id != fragment.id);
                }
                final_fragments.extend(new_fragments);
            }
        }
        Ok(())
    }

    fn assign_row_ids(next_row_id: &mut u64, fragments: &mut [Fragment]) -> Result<()> {
        for fragment in fragments {
            let physical_rows = fragment.physical_rows.ok_or_else(|| {
                Error::internal("Fragment does not have physical rows", location!())
            })? as u64;
            fragment.row_id_meta = Some(RowIdMeta {
                start: *next_row_id,
                end: *next_row_id + physical_rows,
            });
            *next_row_id += physical_rows;
        }
        Ok(())
    }
}

/// Check that `operation` can be applied to `manifest`.
///
/// `manifest` is `None` when the dataset does not exist yet, in which case
/// only an Overwrite is accepted.
pub fn validate_operation(manifest: Option<&Manifest>, operation: &Operation) -> Result<()> {
    let manifest = match (manifest, operation) {
        (
            None,
            Operation::Overwrite {
                fragments, schema, ..
            },
        ) => {
            // Validate here because we are going to return early.
            schema_fragments_valid(schema, fragments)?;

            return Ok(());
        }
        (Some(manifest), _) => manifest,
        (None, _) => {
            return Err(Error::invalid_input(
                format!(
                    "Cannot apply operation {} to non-existent dataset",
                    operation.name()
                ),
                location!(),
            ));
        }
    };

    match operation {
        Operation::Append { fragments } => {
            // Fragments must contain all fields in the schema
            schema_fragments_valid(&manifest.schema, fragments)
        }
        Operation::Project { schema } => {
            schema_fragments_valid(schema, manifest.fragments.as_ref())
        }
        Operation::Merge { fragments, schema }
        | Operation::Overwrite {
            fragments, schema, ..
        } => schema_fragments_valid(schema, fragments),
        Operation::Update {
            updated_fragments,
            new_fragments,
            ..
        } => {
            schema_fragments_valid(&manifest.schema, updated_fragments)?;
            schema_fragments_valid(&manifest.schema, new_fragments)
        }
        Operation::Rewrite { groups, .. } => {
            if groups.iter().any(|group| group.old_fragments.is_empty()) {
                return Err(Error::malformed_operation(
                    "a rewrite group must replace at least one fragment",
                    location!(),
                ));
            }
            Ok(())
        }
        Operation::Restore { version } if *version == 0 => Err(Error::malformed_operation(
            "cannot restore version 0",
            location!(),
        )),
        _ => Ok(()),
    }
}

/// Check that each fragment contains all fields in the schema.
/// It is not required that the schema contains all fields in the fragment.
/// There may be masked fields.
fn schema_fragments_valid(schema: &Schema, fragments: &[Fragment]) -> Result<()> {
    schema.validate()?;
    for fragment in fragments {
        for field in schema.fields_pre_order() {
            if !fragment.field_ids().any(|f_id| f_id == field.id) {
                return Err(Error::malformed_operation(
                    format!(
                        "Fragment {} does not contain field {:?}",
                        fragment.id, field
                    ),
                    location!(),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use vellum_core::datatypes::Field;
    use vellum_table::feature_flags::FLAG_STABLE_ROW_IDS;

    use super::*;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", "int64", false),
            Field::new("name", "utf8", true),
        ])
    }

    fn fragment(id: u64, rows: usize) -> Fragment {
        Fragment::with_file(
            id,
            &format!("data/{}.vellum", id),
            &schema(),
            FileVersion::V2_0,
            rows,
        )
    }

    fn overwrite(fragments: Vec<Fragment>) -> Transaction {
        Transaction::new(
            0,
            Operation::Overwrite {
                fragments,
                schema: schema(),
                config_upsert_values: None,
            },
            None,
        )
    }

    fn first_manifest(fragments: Vec<Fragment>) -> Manifest {
        overwrite(fragments)
            .build_manifest(None, "0-a.txn", &ManifestWriteConfig::default())
            .unwrap()
    }

    #[test]
    fn test_builder() {
        let txn = TransactionBuilder::new(3)
            .operation(Operation::ReserveFragments { num_fragments: 1 })
            .tag("nightly")
            .transaction_properties(HashMap::from([("k".to_string(), "v".to_string())]))
            .uuid("fixed")
            .build()
            .unwrap();
        assert_eq!(txn.read_version, 3);
        assert_eq!(txn.uuid, "fixed");
        assert_eq!(txn.tag.as_deref(), Some("nightly"));
        assert_eq!(txn.operation.name(), "ReserveFragments");

        let err = TransactionBuilder::new(0).build().unwrap_err();
        assert!(err.to_string().contains("has no operations"), "{}", err);

        let err = TransactionBuilder::new(0)
            .operation(Operation::Restore { version: 1 })
            .operation(Operation::ReserveFragments { num_fragments: 1 })
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }));
        assert!(
            err.to_string()
                .contains("Operation Restore has already been set"),
            "{}",
            err
        );

        let a = TransactionBuilder::new(0)
            .operation(Operation::Restore { version: 1 })
            .build()
            .unwrap();
        let b = TransactionBuilder::new(0)
            .operation(Operation::Restore { version: 1 })
            .build()
            .unwrap();
        assert_ne!(a.uuid, b.uuid);
    }

    #[test]
    fn test_transaction_json() {
        let txn = TransactionBuilder::new(1)
            .operation(Operation::UpdateConfig {
                upsert_values: Some(HashMap::from([("a".to_string(), "1".to_string())])),
                delete_keys: Some(vec!["b".to_string()]),
            })
            .build()
            .unwrap();
        let json = serde_json::to_value(&txn).unwrap();
        assert_eq!(json["operation"]["type"], "UpdateConfig");
        let read: Transaction = serde_json::from_value(json).unwrap();
        assert_eq!(read, txn);
    }

    #[test]
    fn test_new_dataset_manifest() {
        let manifest = first_manifest(vec![Fragment::new(0), fragment(0, 10)]);
        assert_eq!(manifest.version, 1);
        let ids = manifest.fragments.iter().map(|f| f.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(manifest.max_fragment_id, Some(1));
        assert_eq!(manifest.transaction_file.as_deref(), Some("0-a.txn"));
        assert_eq!(
            manifest.data_storage_format,
            DataStorageFormat::new(FileVersion::V2_0)
        );

        let err = Transaction::new(0, Operation::Append { fragments: vec![] }, None)
            .build_manifest(None, "x.txn", &ManifestWriteConfig::default())
            .unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
    }

    #[test]
    fn test_requested_storage_format() {
        let config = ManifestWriteConfig {
            storage_format: Some(DataStorageFormat::new(FileVersion::V2_1)),
            ..Default::default()
        };
        let err = overwrite(vec![fragment(0, 10)])
            .build_manifest(None, "x.txn", &config)
            .unwrap_err();
        assert!(err.to_string().contains("does not match"), "{}", err);

        let manifest = overwrite(vec![])
            .build_manifest(None, "x.txn", &config)
            .unwrap();
        assert_eq!(
            manifest.data_storage_format,
            DataStorageFormat::new(FileVersion::V2_1)
        );
    }

    #[test]
    fn test_append_assigns_ids() {
        let base = first_manifest(vec![fragment(0, 10)]);
        let txn = Transaction::new(
            1,
            Operation::Append {
                fragments: vec![fragment(0, 5), fragment(0, 5)],
            },
            Some("tagged".to_string()),
        );
        let manifest = txn
            .build_manifest(Some(&base), "1-b.txn", &ManifestWriteConfig::default())
            .unwrap();
        assert_eq!(manifest.version, 2);
        let ids = manifest.fragments.iter().map(|f| f.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(manifest.count_rows(), Some(20));
        assert_eq!(manifest.tag.as_deref(), Some("tagged"));
        assert_eq!(manifest.transaction_uuid.as_deref(), Some(txn.uuid.as_str()));
    }

    #[test]
    fn test_stable_row_ids() {
        let config = ManifestWriteConfig {
            use_stable_row_ids: true,
            ..Default::default()
        };
        let base = overwrite(vec![fragment(0, 10)])
            .build_manifest(None, "x.txn", &config)
            .unwrap();
        assert_eq!(base.reader_feature_flags & FLAG_STABLE_ROW_IDS, FLAG_STABLE_ROW_IDS);
        assert_eq!(base.next_row_id, 10);

        let appended = Transaction::new(
            1,
            Operation::Append {
                fragments: vec![fragment(0, 5)],
            },
            None,
        )
        .build_manifest(Some(&base), "y.txn", &ManifestWriteConfig::default())
        .unwrap();
        assert_eq!(
            appended.fragments[1].row_id_meta,
            Some(RowIdMeta { start: 10, end: 15 })
        );
        assert_eq!(appended.next_row_id, 15);

        let plain = first_manifest(vec![fragment(0, 10)]);
        let err = Transaction::new(1, Operation::ReserveFragments { num_fragments: 1 }, None)
            .build_manifest(Some(&plain), "z.txn", &config)
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported { .. }));

        let mut missing_rows = Fragment::new(0);
        missing_rows.physical_rows = None;
        let err = overwrite(vec![missing_rows])
            .build_manifest(None, "x.txn", &config)
            .unwrap_err();
        assert!(err.to_string().contains("physical rows"), "{}", err);
    }

    #[test]
    fn test_delete_and_update() {
        let mut base = first_manifest(vec![fragment(0, 10), fragment(0, 10), fragment(0, 10)]);
        base.indices = vec![IndexMetadata::new("idx", vec![0], 1).with_fragment_bitmap([2])];

        let mut updated = fragment(1, 10);
        updated.physical_rows = Some(8);
        let deleted = Transaction::new(
            1,
            Operation::Delete {
                updated_fragments: vec![updated.clone()],
                deleted_fragment_ids: vec![2],
                predicate: "id > 3".to_string(),
            },
            None,
        )
        .build_manifest(Some(&base), "d.txn", &ManifestWriteConfig::default())
        .unwrap();
        assert_eq!(deleted.fragments.as_ref(), &vec![fragment(0, 10), updated]);
        // The index only covered the deleted fragment.
        assert!(deleted.indices.is_empty());

        let updated = Transaction::new(
            1,
            Operation::Update {
                removed_fragment_ids: vec![0],
                updated_fragments: vec![],
                new_fragments: vec![fragment(0, 4)],
            },
            None,
        )
        .build_manifest(Some(&base), "u.txn", &ManifestWriteConfig::default())
        .unwrap();
        let ids = updated.fragments.iter().map(|f| f.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(updated.indices.len(), 1);
    }

    #[test]
    fn test_overwrite_resets() {
        let mut base = first_manifest(vec![fragment(0, 10), fragment(0, 10)]);
        base.indices = vec![IndexMetadata::new("idx", vec![0], 1)];
        base.config.insert("keep".to_string(), "yes".to_string());

        let manifest = Transaction::new(
            1,
            Operation::Overwrite {
                fragments: vec![fragment(0, 40)],
                schema: schema(),
                config_upsert_values: Some(HashMap::from([(
                    "added".to_string(),
                    "1".to_string(),
                )])),
            },
            None,
        )
        .build_manifest(Some(&base), "o.txn", &ManifestWriteConfig::default())
        .unwrap();
        assert_eq!(manifest.fragments.len(), 1);
        assert_eq!(manifest.fragments[0].id, 0);
        assert!(manifest.indices.is_empty());
        assert_eq!(manifest.count_rows(), Some(40));
        assert_eq!(manifest.config.get("added").map(String::as_str), Some("1"));
        assert_eq!(manifest.config.get("keep").map(String::as_str), Some("yes"));
    }

    #[test]
    fn test_project_drops_files_and_indices() {
        let mut frag = fragment(0, 10);
        frag.files.push(vellum_table::format::DataFile::new_with_version(
            "data/extra.vellum",
            vec![2],
            FileVersion::V2_0,
        ));
        let mut base = first_manifest(vec![frag]);
        base.indices = vec![
            IndexMetadata::new("by_id", vec![0], 1),
            IndexMetadata::new("by_extra", vec![2], 1),
        ];

        let projected = schema().project(&["id", "name"]).unwrap();
        let manifest = Transaction::new(
            1,
            Operation::Project {
                schema: projected.clone(),
            },
            None,
        )
        .build_manifest(Some(&base), "p.txn", &ManifestWriteConfig::default())
        .unwrap();
        assert_eq!(manifest.schema, projected);
        assert_eq!(manifest.fragments[0].files.len(), 1);
        let names = manifest
            .indices
            .iter()
            .map(|i| i.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["by_id"]);
    }

    #[test]
    fn test_create_index_replaces_by_name() {
        let mut base = first_manifest(vec![fragment(0, 10)]);
        let old = IndexMetadata::new("idx", vec![0], 1);
        let dropped = IndexMetadata::new("other", vec![1], 1);
        base.indices = vec![old.clone(), dropped.clone()];

        let new = IndexMetadata::new("idx", vec![0], 2);
        let manifest = Transaction::new(
            1,
            Operation::CreateIndex {
                new_indices: vec![new.clone()],
                removed_indices: vec![dropped],
            },
            None,
        )
        .build_manifest(Some(&base), "i.txn", &ManifestWriteConfig::default())
        .unwrap();
        assert_eq!(manifest.indices, vec![new]);
    }

    #[test]
    fn test_update_config() {
        let mut base = first_manifest(vec![]);
        base.config = HashMap::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);
        let manifest = Transaction::new(
            1,
            Operation::UpdateConfig {
                upsert_values: Some(HashMap::from([("b".to_string(), "3".to_string())])),
                delete_keys: Some(vec!["a".to_string(), "b".to_string()]),
            },
            None,
        )
        .build_manifest(Some(&base), "c.txn", &ManifestWriteConfig::default())
        .unwrap();
        assert_eq!(
            manifest.config,
            HashMap::from([("b".to_string(), "3".to_string())])
        );
    }

    #[test]
    fn test_reserve_fragments() {
        let base = first_manifest(vec![fragment(0, 10)]);
        let reserved = Transaction::new(1, Operation::ReserveFragments { num_fragments: 3 }, None)
            .build_manifest(Some(&base), "r.txn", &ManifestWriteConfig::default())
            .unwrap();
        assert_eq!(reserved.max_fragment_id, Some(3));

        let appended = Transaction::new(
            2,
            Operation::Append {
                fragments: vec![fragment(0, 1)],
            },
            None,
        )
        .build_manifest(Some(&reserved), "a.txn", &ManifestWriteConfig::default())
        .unwrap();
        assert_eq!(appended.fragments[1].id, 4);

        let empty = first_manifest(vec![]);
        let reserved = Transaction::new(1, Operation::ReserveFragments { num_fragments: 2 }, None)
            .build_manifest(Some(&empty), "r.txn", &ManifestWriteConfig::default())
            .unwrap();
        assert_eq!(reserved.max_fragment_id, Some(1));
    }

    #[test]
    fn test_rewrite_remaps_indices() {
        let mut base = first_manifest((0..4).map(|_| fragment(0, 10)).collect());
        let index = IndexMetadata::new("idx", vec![0], 1).with_fragment_bitmap([1, 2, 3]);
        base.indices = vec![index.clone()];

        let new_id = Uuid::new_v4();
        let manifest = Transaction::new(
            1,
            Operation::Rewrite {
                groups: vec![RewriteGroup {
                    old_fragments: vec![fragment(1, 10), fragment(2, 10)],
                    new_fragments: vec![fragment(0, 20)],
                }],
                rewritten_indices: vec![RewrittenIndex {
                    old_id: index.uuid,
                    new_id,
                }],
            },
            None,
        )
        .build_manifest(Some(&base), "w.txn", &ManifestWriteConfig::default())
        .unwrap();
        let ids = manifest.fragments.iter().map(|f| f.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![0, 3, 4]);
        assert_eq!(manifest.indices[0].uuid, new_id);
        assert_eq!(
            manifest.indices[0]
                .fragment_bitmap
                .as_ref()
                .unwrap()
                .iter()
                .collect::<Vec<_>>(),
            vec![3, 4]
        );

        let split = Transaction::new(
            1,
            Operation::Rewrite {
                groups: vec![RewriteGroup {
                    old_fragments: vec![fragment(0, 10), fragment(1, 10)],
                    new_fragments: vec![fragment(0, 20)],
                }],
                rewritten_indices: vec![RewrittenIndex {
                    old_id: index.uuid,
                    new_id,
                }],
            },
            None,
        )
        .build_manifest(Some(&base), "w.txn", &ManifestWriteConfig::default());
        assert!(matches!(split, Err(Error::InvalidInput { .. })));
    }

    #[test]
    fn test_rewrite_fragments() {
        let existing_fragments: Vec<Fragment> = (0..10).map(Fragment::new).collect();

        let mut final_fragments = existing_fragments;
        let rewrite_groups = vec![
            // Since these are contiguous, they will be put in the same location
            // as 1 and 2.
            RewriteGroup {
                old_fragments: vec![Fragment::new(1), Fragment::new(2)],
                // These two fragments were previously reserved
                new_fragments: vec![Fragment::new(15), Fragment::new(16)],
            },
            // These are not contiguous, so they will be inserted at the end.
            RewriteGroup {
                old_fragments: vec![Fragment::new(5), Fragment::new(8)],
                // This id was not reserved, so it gets the next free id.
                new_fragments: vec![Fragment::new(0)],
            },
        ];

        let mut fragment_id = 20;
        let version = 0;

        Transaction::handle_rewrite_fragments(
            &mut final_fragments,
            &rewrite_groups,
            &mut fragment_id,
            version,
        )
        .unwrap();

        assert_eq!(fragment_id, 21);

        let expected_fragments: Vec<Fragment> = vec![
            Fragment::new(0),
            Fragment::new(15),
            Fragment::new(16),
            Fragment::new(3),
            Fragment::new(4),
            Fragment::new(6),
            Fragment::new(7),
            Fragment::new(9),
            Fragment::new(20),
        ];

        assert_eq!(final_fragments, expected_fragments);

        let missing = vec![RewriteGroup {
            old_fragments: vec![Fragment::new(42)],
            new_fragments: vec![],
        }];
        let err = Transaction::handle_rewrite_fragments(
            &mut final_fragments,
            &missing,
            &mut fragment_id,
            7,
        )
        .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_validate_operation() {
        let base = first_manifest(vec![fragment(0, 10)]);

        validate_operation(
            None,
            &Operation::Overwrite {
                fragments: vec![fragment(0, 1)],
                schema: schema(),
                config_upsert_values: Some(HashMap::new()),
            },
        )
        .unwrap();
        let err = validate_operation(None, &Operation::Append { fragments: vec![] }).unwrap_err();
        assert!(err.to_string().contains("non-existent dataset"), "{}", err);

        let partial = Fragment::with_file(
            0,
            "data/partial.vellum",
            &schema().project(&["id"]).unwrap(),
            FileVersion::V2_0,
            10,
        );
        let err = validate_operation(
            Some(&base),
            &Operation::Append {
                fragments: vec![partial],
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::MalformedOperation { .. }));

        let err = validate_operation(
            Some(&base),
            &Operation::Rewrite {
                groups: vec![RewriteGroup {
                    old_fragments: vec![],
                    new_fragments: vec![fragment(0, 1)],
                }],
                rewritten_indices: vec![],
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::MalformedOperation { .. }));

        validate_operation(Some(&base), &Operation::Restore { version: 1 }).unwrap();

        let duplicated = Schema::new(vec![
            Field::new("id", "int64", false),
            Field::new("id", "utf8", true),
        ]);
        let err = validate_operation(
            None,
            &Operation::Overwrite {
                fragments: vec![],
                schema: duplicated,
                config_upsert_values: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Schema { .. }), "{}", err);
    }

    #[test]
    fn test_upsert_key_conflict() {
        let upsert = |keys: &[&str]| Operation::UpdateConfig {
            upsert_values: Some(
                keys.iter()
                    .map(|k| (k.to_string(), "v".to_string()))
                    .collect(),
            ),
            delete_keys: None,
        };
        let delete = |keys: &[&str]| Operation::UpdateConfig {
            upsert_values: None,
            delete_keys: Some(keys.iter().map(|k| k.to_string()).collect()),
        };
        assert!(upsert(&["a"]).upsert_key_conflict(&upsert(&["a"])));
        assert!(!upsert(&["a"]).upsert_key_conflict(&upsert(&["b"])));
        assert!(upsert(&["a"]).upsert_key_conflict(&delete(&["a"])));
        assert!(delete(&["a"]).upsert_key_conflict(&upsert(&["a"])));
        // Deleting the same key twice is harmless.
        assert!(!delete(&["a"]).upsert_key_conflict(&delete(&["a"])));
    }
}
