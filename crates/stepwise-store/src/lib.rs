pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStorage;
pub use sqlite::SqliteStorage;

use std::sync::Arc;

use stepwise_core::config::{StorageBackend, StorageConfig};
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::ProcessStorage;

/// Build and initialize the storage backend selected by config.
pub async fn open_storage(config: &StorageConfig) -> Result<Arc<dyn ProcessStorage>> {
    let storage: Arc<dyn ProcessStorage> = match config.backend {
        StorageBackend::Memory => Arc::new(InMemoryStorage::new()),
        StorageBackend::Sqlite => {
            let path = config.resolved_path().ok_or_else(|| {
                StepwiseError::Config("storage.path is required for the sqlite backend".into())
            })?;
            Arc::new(SqliteStorage::open(&path)?)
        }
    };
    storage.initialize().await?;
    Ok(storage)
}
