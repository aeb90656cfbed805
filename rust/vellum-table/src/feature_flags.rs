// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Feature flags

use snafu::location;

use crate::format::Manifest;
use vellum_core::{Error, Result};

/// Fragments may contain deletion files, which record the tombstones of
/// soft-deleted rows.
pub const FLAG_DELETION_FILES: u64 = 1;
/// Row ids are stable after moves, but not updates. Fragments record the range
/// of row ids they own.
pub const FLAG_STABLE_ROW_IDS: u64 = 2;
/// The first bit that is unknown as a feature flag
pub const FLAG_UNKNOWN: u64 = 4;

/// Set the reader and writer feature flags in the manifest based on the contents of the manifest.
pub fn apply_feature_flags(manifest: &mut Manifest, enable_stable_row_id: bool) -> Result<()> {
    // Reset flags
    manifest.reader_feature_flags = 0;
    manifest.writer_feature_flags = 0;

    let has_deletion_files = manifest
        .fragments
        .iter()
        .any(|frag| frag.deletion_file.is_some());
    if has_deletion_files {
        // Both readers and writers need to be able to read deletion files
        manifest.reader_feature_flags |= FLAG_DELETION_FILES;
        manifest.writer_feature_flags |= FLAG_DELETION_FILES;
    }

    // If any fragment has row ids, they must all have row ids.
    let has_row_ids = manifest
        .fragments
        .iter()
        .any(|frag| frag.row_id_meta.is_some());
    if has_row_ids || enable_stable_row_id {
        if !manifest
            .fragments
            .iter()
            .all(|frag| frag.row_id_meta.is_some())
        {
            return Err(Error::invalid_input(
                "All fragments must have row ids",
                location!(),
            ));
        }
        manifest.reader_feature_flags |= FLAG_STABLE_ROW_IDS;
        manifest.writer_feature_flags |= FLAG_STABLE_ROW_IDS;
    }

    Ok(())
}

pub fn can_read_dataset(reader_flags: u64) -> bool {
    reader_flags < FLAG_UNKNOWN
}

pub fn can_write_dataset(writer_flags: u64) -> bool {
    writer_flags < FLAG_UNKNOWN
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::format::{DataStorageFormat, DeletionFile, DeletionFileType, Fragment, RowIdMeta};

    #[test]
    fn test_read_check() {
        assert!(can_read_dataset(0));
        assert!(can_read_dataset(super::FLAG_DELETION_FILES));
        assert!(can_read_dataset(super::FLAG_STABLE_ROW_IDS));
        assert!(can_read_dataset(
            super::FLAG_DELETION_FILES | super::FLAG_STABLE_ROW_IDS
        ));
        assert!(!can_read_dataset(super::FLAG_UNKNOWN));
    }

    #[test]
    fn test_write_check() {
        assert!(can_write_dataset(0));
        assert!(can_write_dataset(super::FLAG_DELETION_FILES));
        assert!(can_write_dataset(super::FLAG_STABLE_ROW_IDS));
        assert!(!can_write_dataset(super::FLAG_UNKNOWN));
    }

    #[test]
    fn test_apply_feature_flags() {
        let mut with_rows = Fragment::new(0);
        with_rows.row_id_meta = Some(RowIdMeta { start: 0, end: 10 });
        let mut with_deletions = Fragment::new(1);
        with_deletions.row_id_meta = Some(RowIdMeta { start: 10, end: 20 });
        with_deletions.deletion_file = Some(DeletionFile {
            read_version: 1,
            id: 0,
            file_type: DeletionFileType::Array,
            num_deleted_rows: Some(1),
        });

        let mut manifest = Manifest::empty(DataStorageFormat::default());
        manifest.fragments = Arc::new(vec![with_rows.clone(), with_deletions]);
        apply_feature_flags(&mut manifest, false).unwrap();
        assert_eq!(
            manifest.reader_feature_flags,
            FLAG_DELETION_FILES | FLAG_STABLE_ROW_IDS
        );
        assert!(manifest.uses_stable_row_ids());

        // Mixing fragments with and without row ids is rejected.
        manifest.fragments = Arc::new(vec![with_rows, Fragment::new(2)]);
        assert!(matches!(
            apply_feature_flags(&mut manifest, false),
            Err(Error::InvalidInput { .. })
        ));

        manifest.fragments = Arc::new(vec![Fragment::new(2)]);
        apply_feature_flags(&mut manifest, false).unwrap();
        assert_eq!(manifest.writer_feature_flags, 0);
    }
}
