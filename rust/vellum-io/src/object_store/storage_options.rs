// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Storage options provider for dynamic credential fetching
//!
//! Storage options (credentials, endpoints) may come from somewhere other
//! than the caller, e.g. a namespace that vends short-lived credentials per
//! table. A provider is only asked when a store is actually built.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use snafu::location;
use vellum_core::{Error, Result};
use vellum_namespace::models::DescribeTableRequest;
use vellum_namespace::Namespace;

/// Trait for providing storage options
///
/// # Equality and Hashing
///
/// Implementations must provide `provider_id()` which returns a unique identifier.
/// Two providers with the same ID are considered equal and will share the same
/// cached ObjectStore in the registry.
#[async_trait]
pub trait StorageOptionsProvider: Send + Sync + fmt::Debug {
    /// Fetch fresh storage options
    ///
    /// Returns None if no storage options are available.
    async fn fetch_storage_options(&self) -> Result<Option<HashMap<String, String>>>;

    /// Return a human-readable unique identifier for this provider instance
    ///
    /// For example: `"namespace[memory],table[db$table1]"`
    fn provider_id(&self) -> String;
}

/// StorageOptionsProvider implementation that fetches options from a [`Namespace`]
pub struct NamespaceStorageOptionsProvider {
    namespace: Arc<dyn Namespace>,
    table_id: Vec<String>,
}

impl fmt::Debug for NamespaceStorageOptionsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.provider_id())
    }
}

impl NamespaceStorageOptionsProvider {
    pub fn new(namespace: Arc<dyn Namespace>, table_id: Vec<String>) -> Self {
        Self {
            namespace,
            table_id,
        }
    }
}

#[async_trait]
impl StorageOptionsProvider for NamespaceStorageOptionsProvider {
    async fn fetch_storage_options(&self) -> Result<Option<HashMap<String, String>>> {
        let request = DescribeTableRequest {
            id: Some(self.table_id.clone()),
            version: None,
        };

        let response = self
            .namespace
            .describe_table(request)
            .await
            .map_err(|e| Error::IO {
                source: Box::new(std::io::Error::other(format!(
                    "Failed to fetch storage options: {}",
                    e
                ))),
                location: location!(),
            })?;

        Ok(response.storage_options)
    }

    fn provider_id(&self) -> String {
        format!(
            "NamespaceStorageOptionsProvider {{ namespace: {}, table_id: {:?} }}",
            self.namespace.namespace_id(),
            self.table_id
        )
    }
}
