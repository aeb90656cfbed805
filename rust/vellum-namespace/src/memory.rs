// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! A namespace that keeps its catalog in memory.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::models::{
    CreateTableVersionRequest, CreateTableVersionResponse, DescribeTableRequest,
    DescribeTableResponse, RegisterTableRequest, RegisterTableResponse,
};
use crate::namespace::{table_id_to_string, Namespace, NamespaceError, Result};

#[derive(Debug, Clone, Default)]
struct TableEntry {
    location: String,
    version: Option<i64>,
    storage_options: Option<HashMap<String, String>>,
    /// Every version reported through `create_table_version`, in call order.
    committed_versions: Vec<(i64, Option<String>)>,
}

/// An in-memory catalog.
///
/// Cloning shares the catalog, so a test can hand one clone to a writer and
/// inspect another.
#[derive(Debug, Clone, Default)]
pub struct MemoryNamespace {
    name: String,
    tables: Arc<RwLock<HashMap<String, TableEntry>>>,
}

impl MemoryNamespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: Default::default(),
        }
    }

    /// Storage options returned with every `describe_table` for `id`.
    pub fn set_storage_options(
        &self,
        id: &[String],
        storage_options: HashMap<String, String>,
    ) -> Result<()> {
        let mut tables = self.write()?;
        let entry = tables
            .get_mut(&table_id_to_string(id))
            .ok_or_else(|| NamespaceError::TableNotFound(table_id_to_string(id)))?;
        entry.storage_options = Some(storage_options);
        Ok(())
    }

    /// Versions reported for `id`, oldest first.
    pub fn committed_versions(&self, id: &[String]) -> Result<Vec<i64>> {
        let tables = self.read()?;
        let entry = tables
            .get(&table_id_to_string(id))
            .ok_or_else(|| NamespaceError::TableNotFound(table_id_to_string(id)))?;
        Ok(entry.committed_versions.iter().map(|(v, _)| *v).collect())
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, TableEntry>>> {
        self.tables
            .read()
            .map_err(|e| NamespaceError::Other(format!("catalog lock poisoned: {}", e)))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, TableEntry>>> {
        self.tables
            .write()
            .map_err(|e| NamespaceError::Other(format!("catalog lock poisoned: {}", e)))
    }
}

fn required_id(id: Option<Vec<String>>) -> Result<Vec<String>> {
    match id {
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(NamespaceError::Other("table id is required".to_string())),
    }
}

#[async_trait]
impl Namespace for MemoryNamespace {
    async fn describe_table(
        &self,
        request: DescribeTableRequest,
    ) -> Result<DescribeTableResponse> {
        let id = required_id(request.id)?;
        let tables = self.read()?;
        let entry = tables
            .get(&table_id_to_string(&id))
            .ok_or_else(|| NamespaceError::TableNotFound(table_id_to_string(&id)))?;
        Ok(DescribeTableResponse {
            location: Some(entry.location.clone()),
            version: request.version.or(entry.version),
            storage_options: entry.storage_options.clone(),
        })
    }

    async fn register_table(
        &self,
        request: RegisterTableRequest,
    ) -> Result<RegisterTableResponse> {
        let id = required_id(request.id)?;
        let mut tables = self.write()?;
        let key = table_id_to_string(&id);
        if tables.contains_key(&key) {
            return Err(NamespaceError::Other(format!(
                "table {} is already registered",
                key
            )));
        }
        tables.insert(
            key,
            TableEntry {
                location: request.location.clone(),
                ..Default::default()
            },
        );
        Ok(RegisterTableResponse {
            location: Some(request.location),
        })
    }

    async fn create_table_version(
        &self,
        request: CreateTableVersionRequest,
    ) -> Result<CreateTableVersionResponse> {
        let id = required_id(request.id)?;
        let mut tables = self.write()?;
        let key = table_id_to_string(&id);
        let entry = tables
            .get_mut(&key)
            .ok_or_else(|| NamespaceError::TableNotFound(key.clone()))?;
        if let Some(latest) = entry.version {
            if request.version <= latest {
                return Err(NamespaceError::Other(format!(
                    "version {} of table {} is not newer than {}",
                    request.version, key, latest
                )));
            }
        }
        log::debug!("Table {} advanced to version {}", key, request.version);
        entry.version = Some(request.version);
        entry
            .committed_versions
            .push((request.version, request.manifest_path));
        Ok(CreateTableVersionResponse {
            version: Some(request.version),
        })
    }

    fn namespace_id(&self) -> String {
        format!("MemoryNamespace {{ name: {:?} }}", self.name)
    }
}
