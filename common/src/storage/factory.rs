use std::sync::Arc;

use super::config::MirrorConfig;
use super::file::FileStore;
use super::in_memory::InMemoryStore;
use super::{KeyValueStore, StorageResult};

/// Builds the store described by `config`.
pub fn create_store(config: &MirrorConfig) -> StorageResult<Arc<dyn KeyValueStore>> {
    match config {
        MirrorConfig::InMemory => Ok(Arc::new(InMemoryStore::new())),
        MirrorConfig::File(file) => {
            tracing::debug!(path = %file.path, "opening file mirror store");
            Ok(Arc::new(FileStore::open(&file.path)?))
        }
    }
}
