// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! On-disk metadata of a Vellum dataset.

mod file_version;
mod fragment;
mod index;
mod manifest;

pub use file_version::{
    FileVersion, LEGACY_FORMAT_VERSION, V2_FORMAT_2_0, V2_FORMAT_2_1, V2_FORMAT_2_2,
};
pub use fragment::{DataFile, DeletionFile, DeletionFileType, Fragment, RowIdMeta};
pub use index::IndexMetadata;
pub use manifest::{
    is_detached_version, DataStorageFormat, Manifest, WriterVersion, DETACHED_VERSION_MASK,
};

/// Directory holding the files written by each transaction.
pub const TRANSACTIONS_DIR: &str = "_transactions";
/// Extension of transaction files.
pub const TRANSACTION_EXTENSION: &str = "txn";
