//! Registry driver for the `sqlite` scheme.

use std::sync::Arc;

use async_trait::async_trait;

use packmule_storage::{Storage, StorageDriver, StorageError, StorageOptions};

use crate::store::SqliteStorage;

/// Connects `sqlite:` urls to [`SqliteStorage`].
#[derive(Debug, Default, Clone)]
pub struct SqliteDriver;

impl SqliteDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StorageDriver for SqliteDriver {
    fn scheme(&self) -> &'static str {
        "sqlite"
    }

    async fn connect(
        &self,
        url: &str,
        options: &StorageOptions,
    ) -> Result<Arc<dyn Storage>, StorageError> {
        Ok(Arc::new(SqliteStorage::connect(url, options).await?))
    }
}
