// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use object_store::path::Path;
use snafu::location;
use url::Url;

use super::{ObjectStore, ObjectStoreParams};
use vellum_core::error::{Error, Result};

pub mod local;
pub mod memory;

#[async_trait::async_trait]
pub trait ObjectStoreProvider: std::fmt::Debug + Sync + Send {
    async fn new_store(&self, base_path: Url, params: &ObjectStoreParams) -> Result<ObjectStore>;

    /// Extract the path relative to the store root from a URL.
    fn extract_path(&self, url: &Url) -> Result<Path> {
        Path::parse(url.path()).map_err(|e| {
            Error::invalid_input(
                format!("Failed to parse path '{}': {}", url.path(), e),
                location!(),
            )
        })
    }

    /// The part of a URL that identifies the store itself.
    ///
    /// URLs with the same prefix share one cached [`ObjectStore`].
    fn calculate_object_store_prefix(
        &self,
        scheme: &str,
        authority: &str,
        _storage_options: Option<&HashMap<String, String>>,
    ) -> Result<String> {
        Ok(format!("{}${}", scheme, authority))
    }
}

/// Maps URL schemes to [`ObjectStoreProvider`]s and caches the stores they build.
#[derive(Debug)]
pub struct ObjectStoreRegistry {
    providers: HashMap<String, Arc<dyn ObjectStoreProvider>>,
    active_stores: Mutex<HashMap<String, Arc<ObjectStore>>>,
}

impl ObjectStoreRegistry {
    pub fn empty() -> Self {
        Self {
            providers: HashMap::new(),
            active_stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_provider(&self, scheme: &str) -> Option<Arc<dyn ObjectStoreProvider>> {
        self.providers.get(scheme).cloned()
    }

    /// Number of stores currently cached.
    pub fn active_store_count(&self) -> usize {
        self.active_stores.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Get the store for `base_path`, creating it on first use.
    ///
    /// The storage options provider in `params`, if any, is only consulted
    /// when a new store has to be built.
    pub async fn get_store(
        &self,
        base_path: Url,
        params: &ObjectStoreParams,
    ) -> Result<Arc<ObjectStore>> {
        let scheme = base_path.scheme();
        let provider = self.get_provider(scheme).ok_or_else(|| {
            Error::invalid_input(
                format!("No object store provider found for scheme: {}", scheme),
                location!(),
            )
        })?;

        let mut cache_key = provider.calculate_object_store_prefix(
            scheme,
            base_path.authority(),
            params.storage_options.as_ref(),
        )?;
        if let Some(options_provider) = &params.storage_options_provider {
            cache_key = format!("{}#{}", cache_key, options_provider.provider_id());
        }

        if let Some(store) = self.cached(&cache_key)? {
            return Ok(store);
        }

        let mut params = params.clone();
        if let Some(options_provider) = &params.storage_options_provider {
            if let Some(fetched) = options_provider.fetch_storage_options().await? {
                let mut merged = params.storage_options.take().unwrap_or_default();
                merged.extend(fetched);
                params.storage_options = Some(merged);
            }
        }
        log::debug!("Creating object store for {}", cache_key);
        let store = Arc::new(provider.new_store(base_path, &params).await?);

        let mut active = self.active_stores.lock().map_err(|e| {
            Error::internal(format!("object store cache poisoned: {}", e), location!())
        })?;
        // Another task may have built the same store while we were awaiting.
        Ok(active.entry(cache_key).or_insert(store).clone())
    }

    fn cached(&self, cache_key: &str) -> Result<Option<Arc<ObjectStore>>> {
        let active = self.active_stores.lock().map_err(|e| {
            Error::internal(format!("object store cache poisoned: {}", e), location!())
        })?;
        Ok(active.get(cache_key).cloned())
    }
}

impl Default for ObjectStoreRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.insert("memory", Arc::new(memory::MemoryStoreProvider));
        registry.insert("file", Arc::new(local::FileStoreProvider));
        registry.insert("file-object-store", Arc::new(local::FileStoreProvider));
        registry
    }
}

impl ObjectStoreRegistry {
    pub fn insert(&mut self, scheme: &str, provider: Arc<dyn ObjectStoreProvider>) {
        self.providers.insert(scheme.into(), provider);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::object_store::StorageOptionsProvider;

    #[derive(Debug, Default)]
    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StorageOptionsProvider for CountingProvider {
        async fn fetch_storage_options(&self) -> Result<Option<HashMap<String, String>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(HashMap::from([(
                "list_is_lexically_ordered".to_string(),
                "false".to_string(),
            )])))
        }

        fn provider_id(&self) -> String {
            "counting".to_string()
        }
    }

    #[tokio::test]
    async fn test_memory_stores_are_shared() {
        let registry = ObjectStoreRegistry::default();
        let params = ObjectStoreParams::default();
        let a = registry
            .get_store(Url::parse("memory://a").unwrap(), &params)
            .await
            .unwrap();
        let b = registry
            .get_store(Url::parse("memory://b/c").unwrap(), &params)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
        assert_eq!(registry.active_store_count(), 1);
    }

    #[tokio::test]
    async fn test_storage_options_provider_is_lazy() {
        let registry = ObjectStoreRegistry::default();
        let provider = Arc::new(CountingProvider::default());
        let params = ObjectStoreParams::default().with_storage_options_provider(provider.clone());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

        let store = registry
            .get_store(Url::parse("memory://t").unwrap(), &params)
            .await
            .unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert!(!store.list_is_lexically_ordered);

        registry
            .get_store(Url::parse("memory://t").unwrap(), &params)
            .await
            .unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_scheme() {
        let registry = ObjectStoreRegistry::default();
        let err = registry
            .get_store(
                Url::parse("unknown://bucket/path").unwrap(),
                &ObjectStoreParams::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }));
    }
}
