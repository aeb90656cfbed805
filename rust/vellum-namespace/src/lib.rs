// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Vellum Namespace
//!
//! A namespace maps hierarchical table identifiers (e.g. `["workspace", "events"]`)
//! to dataset locations and is told about every version committed through it.

pub mod memory;
pub mod models;
pub mod namespace;

// Re-export the trait at the crate root
pub use memory::MemoryNamespace;
pub use namespace::{Namespace, NamespaceError, Result};
