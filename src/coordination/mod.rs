pub mod memory;
pub mod sqlite;
pub mod traits;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{CoordinationStore, StoreError};

use crate::config::StoreConfig;
use std::path::Path;
use std::sync::Arc;

/// Build the coordination store selected by `[store] backend`.
pub fn create_store(
    config: &StoreConfig,
    workspace_dir: &Path,
) -> anyhow::Result<Arc<dyn CoordinationStore>> {
    match config.backend.as_str() {
        "sqlite" => {
            let path = config
                .path
                .clone()
                .unwrap_or_else(|| workspace_dir.join("coordination.db"));
            Ok(Arc::new(SqliteStore::open(&path)?))
        }
        "memory" => Ok(Arc::new(InMemoryStore::new())),
        other => {
            tracing::warn!("Unknown coordination store backend '{other}', falling back to memory");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn factory_selects_backend() {
        let tmp = TempDir::new().unwrap();

        let memory = create_store(&StoreConfig::default(), tmp.path()).unwrap();
        assert_eq!(memory.name(), "memory");

        let sqlite = create_store(
            &StoreConfig {
                backend: "sqlite".into(),
                path: None,
            },
            tmp.path(),
        )
        .unwrap();
        assert_eq!(sqlite.name(), "sqlite");
        assert!(tmp.path().join("coordination.db").exists());
    }

    #[test]
    fn factory_unknown_backend_falls_back_to_memory() {
        let tmp = TempDir::new().unwrap();
        let store = create_store(
            &StoreConfig {
                backend: "redis".into(),
                path: None,
            },
            tmp.path(),
        )
        .unwrap();
        assert_eq!(store.name(), "memory");
    }
}
