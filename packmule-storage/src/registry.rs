//! Backend selection keyed by storage-url scheme.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::contract::Storage;
use crate::error::StorageError;
use crate::options::StorageOptions;

/// A connectable backend for one url scheme.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// The scheme this driver claims, e.g. `sqlite`.
    fn scheme(&self) -> &'static str;

    /// Open a store for the given url.
    async fn connect(
        &self,
        url: &str,
        options: &StorageOptions,
    ) -> Result<Arc<dyn Storage>, StorageError>;
}

/// Maps url schemes to drivers.
///
/// The engine treats the url prefix opaquely: whatever precedes the first
/// `:` selects the driver, which then interprets the rest.
#[derive(Default)]
pub struct StorageRegistry {
    drivers: HashMap<&'static str, Arc<dyn StorageDriver>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a driver, replacing any previous driver for the same scheme.
    pub fn register(&mut self, driver: Arc<dyn StorageDriver>) {
        self.drivers.insert(driver.scheme(), driver);
    }

    /// Resolve the scheme of `url` and connect through the matching driver.
    pub async fn open(
        &self,
        url: &str,
        options: &StorageOptions,
    ) -> Result<Arc<dyn Storage>, StorageError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(StorageError::EmptyUrl);
        }
        let scheme =
            scheme_of(url).ok_or_else(|| StorageError::MissingScheme(url.to_owned()))?;
        let driver = self
            .drivers
            .get(scheme)
            .ok_or_else(|| StorageError::UnknownScheme(scheme.to_owned()))?;
        driver.connect(url, options).await
    }
}

impl std::fmt::Debug for StorageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut schemes: Vec<_> = self.drivers.keys().collect();
        schemes.sort();
        f.debug_struct("StorageRegistry")
            .field("schemes", &schemes)
            .finish()
    }
}

/// The scheme of a storage url: everything before the first `:`, when it is
/// a plausible scheme token.
pub fn scheme_of(url: &str) -> Option<&str> {
    let (scheme, _) = url.split_once(':')?;
    if scheme.is_empty() {
        return None;
    }
    if !scheme
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
    {
        return None;
    }
    Some(scheme)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_extraction() {
        assert_eq!(scheme_of("sqlite://jobs.db"), Some("sqlite"));
        assert_eq!(scheme_of("sqlite::memory:"), Some("sqlite"));
        assert_eq!(scheme_of("mongodb://localhost/queue"), Some("mongodb"));
        assert_eq!(scheme_of("no-scheme-here"), None);
        assert_eq!(scheme_of(":memory:"), None);
        assert_eq!(scheme_of("bad scheme://x"), None);
    }

    #[tokio::test]
    async fn open_rejects_empty_and_unknown() {
        let registry = StorageRegistry::new();
        let options = StorageOptions::default();

        match registry.open("", &options).await {
            Err(StorageError::EmptyUrl) => {}
            Err(other) => panic!("expected EmptyUrl, got Err({other:?})"),
            Ok(_) => panic!("expected EmptyUrl, got Ok"),
        }
        match registry.open("redis://localhost", &options).await {
            Err(StorageError::UnknownScheme(scheme)) => assert_eq!(scheme, "redis"),
            Err(other) => panic!("expected UnknownScheme, got Err({other:?})"),
            Ok(_) => panic!("expected UnknownScheme, got Ok"),
        }
    }
}
