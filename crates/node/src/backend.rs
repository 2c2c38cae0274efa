//! Store backends selectable with `--backend`.

use std::path::Path;
use std::sync::Arc;

use dualchain_chainstate::store::{MemoryOpener, StoreKind, StoreOpener};
use dualchain_storage::fjall::{FjallOptions, FjallStore};
use dualchain_storage::{KeyValueStore, StoreError};

use crate::config::Backend;

/// Opens one fjall keyspace per store directory, sized from the cache budget.
#[derive(Default)]
pub struct FjallOpener;

impl StoreOpener for FjallOpener {
    fn open(
        &self,
        kind: StoreKind,
        path: &Path,
        cache_bytes: u64,
    ) -> Result<Arc<dyn KeyValueStore>, StoreError> {
        std::fs::create_dir_all(path).map_err(|err| {
            StoreError::Backend(format!("failed to create {}: {err}", path.display()))
        })?;
        log_debug!(
            "Opening {} at {} ({} byte cache)",
            kind.as_str(),
            path.display(),
            cache_bytes
        );
        let store = FjallStore::open_with_options(path, FjallOptions::with_cache_bytes(cache_bytes))?;
        Ok(Arc::new(store))
    }

    fn destroy(&self, kind: StoreKind, path: &Path) -> Result<(), StoreError> {
        log_info!("Wiping {} at {}", kind.as_str(), path.display());
        FjallStore::destroy(path)
    }
}

pub fn store_opener(backend: Backend) -> Arc<dyn StoreOpener> {
    match backend {
        Backend::Memory => Arc::new(MemoryOpener::new()),
        Backend::Fjall => Arc::new(FjallOpener),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dualchain_storage::Column;

    #[test]
    fn fjall_stores_survive_reopen_and_destroy_wipes_them() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("chainstate");
        let opener = store_opener(Backend::Fjall);
        {
            let store = opener
                .open(StoreKind::ChainState, &path, 1 << 20)
                .expect("open");
            store.put(Column::Meta, b"k", b"v").expect("put");
            store.flush().expect("flush");
        }
        {
            let store = opener
                .open(StoreKind::ChainState, &path, 1 << 20)
                .expect("reopen");
            assert_eq!(store.get(Column::Meta, b"k").expect("get"), Some(b"v".to_vec()));
        }
        opener.destroy(StoreKind::ChainState, &path).expect("destroy");
        assert!(!path.exists());
    }
}
