// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! I/O for committing transactions.

pub mod commit;

pub use vellum_io::object_store::{ObjectStore, ObjectStoreParams, ObjectStoreRegistry};
