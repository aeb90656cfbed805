// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Vellum Namespace base interface.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{
    CreateTableVersionRequest, CreateTableVersionResponse, DescribeTableRequest,
    DescribeTableResponse, RegisterTableRequest, RegisterTableResponse,
};

/// Error type for namespace operations
#[derive(Debug, Error)]
pub enum NamespaceError {
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for namespace operations
pub type Result<T> = std::result::Result<T, NamespaceError>;

/// Base trait for namespace implementations.
///
/// Every method defaults to [`NamespaceError::NotSupported`] so that an
/// implementation only provides what its backend can do.
#[async_trait]
pub trait Namespace: Send + Sync + std::fmt::Debug {
    /// Describe a table: where it lives and how to open its store.
    async fn describe_table(
        &self,
        _request: DescribeTableRequest,
    ) -> Result<DescribeTableResponse> {
        Err(NamespaceError::NotSupported("describe_table".to_string()))
    }

    /// Register an existing table location under an id.
    async fn register_table(
        &self,
        _request: RegisterTableRequest,
    ) -> Result<RegisterTableResponse> {
        Err(NamespaceError::NotSupported("register_table".to_string()))
    }

    /// Record that a new version of a table was committed.
    async fn create_table_version(
        &self,
        _request: CreateTableVersionRequest,
    ) -> Result<CreateTableVersionResponse> {
        Err(NamespaceError::NotSupported(
            "create_table_version".to_string(),
        ))
    }

    /// A stable identifier for this namespace instance.
    ///
    /// Used to tell apart storage options providers backed by different
    /// namespaces.
    fn namespace_id(&self) -> String;
}

/// Render a table id as `a$b$c`, the form used in logs and error messages.
pub fn table_id_to_string(id: &[String]) -> String {
    id.join("$")
}
