// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Extend [object_store::ObjectStore] functionalities

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use object_store::{path::Path, ObjectMeta, ObjectStore as OSObjectStore, PutPayload};
use shellexpand::tilde;
use snafu::location;
use url::Url;

pub mod providers;
pub mod storage_options;

use providers::local::FileStoreProvider;
use providers::memory::MemoryStoreProvider;
pub use providers::{ObjectStoreProvider, ObjectStoreRegistry};
pub use storage_options::{NamespaceStorageOptionsProvider, StorageOptionsProvider};
use vellum_core::{Error, Result};

/// Wraps [ObjectStore](object_store::ObjectStore)
#[derive(Debug, Clone)]
pub struct ObjectStore {
    // Inner object store
    pub inner: Arc<dyn OSObjectStore>,
    scheme: String,
    /// Whether we can assume that the list of files is lexically ordered. This
    /// is true for object stores, but not for local filesystems.
    pub list_is_lexically_ordered: bool,
}

impl std::fmt::Display for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectStore({})", self.scheme)
    }
}

/// Parameters to create an [ObjectStore]
///
#[derive(Debug, Clone, Default)]
pub struct ObjectStoreParams {
    pub storage_options: Option<HashMap<String, String>>,
    /// Fetched when the store is first resolved. Options it returns take
    /// precedence over `storage_options`.
    pub storage_options_provider: Option<Arc<dyn StorageOptionsProvider>>,
    pub list_is_lexically_ordered: Option<bool>,
}

impl ObjectStoreParams {
    pub fn with_storage_options(self, storage_options: HashMap<String, String>) -> Self {
        Self {
            storage_options: Some(storage_options),
            ..self
        }
    }

    pub fn with_storage_options_provider(
        self,
        provider: Arc<dyn StorageOptionsProvider>,
    ) -> Self {
        Self {
            storage_options_provider: Some(provider),
            ..self
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct StorageOptions(pub HashMap<String, String>);

impl StorageOptions {
    /// Create a new instance of [`StorageOptions`]
    pub fn new(options: HashMap<String, String>) -> Self {
        Self(options)
    }

    /// Explicit override for [`ObjectStore::list_is_lexically_ordered`].
    pub fn list_is_lexically_ordered(&self) -> Option<bool> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("list_is_lexically_ordered"))
            .map(|(_, value)| str_is_truthy(value))
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }
}

impl From<HashMap<String, String>> for StorageOptions {
    fn from(value: HashMap<String, String>) -> Self {
        Self::new(value)
    }
}

fn str_is_truthy(val: &str) -> bool {
    val.eq_ignore_ascii_case("1")
        | val.eq_ignore_ascii_case("true")
        | val.eq_ignore_ascii_case("on")
        | val.eq_ignore_ascii_case("yes")
        | val.eq_ignore_ascii_case("y")
}

/// Parse a dataset location that is either a URL or a local path.
pub fn uri_to_url(uri: &str) -> Result<Url> {
    match Url::parse(uri) {
        Ok(url) if url.scheme().len() == 1 && cfg!(windows) => {
            // On Windows, the drive is parsed as a scheme
            local_path_to_url(uri)
        }
        Ok(url) => Ok(url),
        Err(_) => local_path_to_url(uri),
    }
}

fn expand_path(str_path: impl AsRef<str>) -> Result<std::path::PathBuf> {
    let expanded = tilde(str_path.as_ref()).to_string();
    if expanded.is_empty() {
        return Ok(std::env::current_dir()?);
    }
    Ok(std::path::absolute(expanded)?)
}

fn local_path_to_url(str_path: &str) -> Result<Url> {
    let expanded_path = expand_path(str_path)?;

    Url::from_directory_path(expanded_path).map_err(|_| Error::InvalidInput {
        source: format!("Invalid table location: '{}'", str_path).into(),
        location: location!(),
    })
}

static DEFAULT_REGISTRY: LazyLock<Arc<ObjectStoreRegistry>> =
    LazyLock::new(|| Arc::new(ObjectStoreRegistry::default()));

/// The registry shared by every handle that does not bring its own.
///
/// Sharing it is what makes two handles to `memory://name` see the same data.
pub fn default_registry() -> Arc<ObjectStoreRegistry> {
    DEFAULT_REGISTRY.clone()
}

impl ObjectStore {
    pub fn new(
        inner: Arc<dyn OSObjectStore>,
        scheme: impl Into<String>,
        list_is_lexically_ordered: bool,
    ) -> Self {
        Self {
            inner,
            scheme: scheme.into(),
            list_is_lexically_ordered,
        }
    }

    /// Parse from a string URI.
    ///
    /// Returns the ObjectStore instance and the absolute path to the object.
    /// This uses the process-wide [`default_registry`].
    pub async fn from_uri(uri: &str) -> Result<(Arc<Self>, Path)> {
        Self::from_uri_and_params(default_registry(), uri, &ObjectStoreParams::default()).await
    }

    /// Parse from a string URI.
    ///
    /// Returns the ObjectStore instance and the absolute path to the object.
    pub async fn from_uri_and_params(
        registry: Arc<ObjectStoreRegistry>,
        uri: &str,
        params: &ObjectStoreParams,
    ) -> Result<(Arc<Self>, Path)> {
        let url = uri_to_url(uri)?;
        let store = registry.get_store(url.clone(), params).await?;
        // We know the scheme is valid if we got a store back.
        let provider = registry.get_provider(url.scheme()).ok_or_else(|| {
            Error::internal(
                format!("Provider for scheme {} disappeared", url.scheme()),
                location!(),
            )
        })?;
        let path = provider.extract_path(&url)?;

        Ok((store, path))
    }

    /// Local object store.
    pub fn local() -> Self {
        FileStoreProvider::store()
    }

    /// Create a in-memory object store directly for testing.
    ///
    /// The store is private to the returned handle.
    pub fn memory() -> Self {
        MemoryStoreProvider::store()
    }

    /// Returns true if the object store pointed to a local file system.
    pub fn is_local(&self) -> bool {
        self.scheme == "file"
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// A helper function to write content to a file, replacing what was there.
    pub async fn put(&self, path: &Path, content: impl Into<Bytes>) -> Result<()> {
        let payload = PutPayload::from(content.into());
        self.inner.put(path, payload).await?;
        Ok(())
    }

    pub async fn delete(&self, path: &Path) -> Result<()> {
        self.inner.delete(path).await?;
        Ok(())
    }

    /// Read a directory (start from base directory) and returns all sub-paths in the directory.
    pub async fn read_dir(&self, dir_path: impl Into<Path>) -> Result<Vec<String>> {
        let path = dir_path.into();
        let output = self.inner.list_with_delimiter(Some(&path)).await?;
        Ok(output
            .common_prefixes
            .iter()
            .chain(output.objects.iter().map(|o| &o.location))
            .filter_map(|s| s.filename().map(str::to_string))
            .collect())
    }

    /// List every object under `path`, recursively.
    pub fn list(&self, path: Option<Path>) -> BoxStream<'_, Result<ObjectMeta>> {
        self.inner
            .list(path.as_ref())
            .map_err(Error::from)
            .boxed()
    }

    /// Remove a directory recursively.
    pub async fn remove_dir_all(&self, dir_path: impl Into<Path>) -> Result<()> {
        let path = dir_path.into();
        let locations = self
            .inner
            .list(Some(&path))
            .map_ok(|meta| meta.location)
            .try_collect::<Vec<_>>()
            .await?;
        for location in locations {
            self.inner.delete(&location).await?;
        }
        if self.is_local() {
            // Local file system needs to delete directories as well.
            let local_path = format!("/{}", path);
            match tokio::fs::remove_dir_all(&local_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Check a file exists.
    pub async fn exists(&self, path: &Path) -> Result<bool> {
        match self.inner.head(path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { path: _, source: _ }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Get file size.
    pub async fn size(&self, path: &Path) -> Result<u64> {
        Ok(self.inner.head(path).await?.size)
    }

    /// Convenience function to read all the bytes of a file
    pub async fn read_one_all(&self, path: &Path) -> Result<Bytes> {
        Ok(self.inner.get(path).await?.bytes().await?)
    }
}
