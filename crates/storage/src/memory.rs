use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{Column, KeyValueStore, PrefixVisitor, StoreError, WriteBatch, WriteOp};

type MemoryStoreMap = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

/// Process-local store. `flush` is a no-op; contents live as long as the value does.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every record in every column.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.write()?.clear();
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreMap>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreMap>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.read()?;
        Ok(guard.get(&(column, key.to_vec())).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.write()?;
        guard.insert((column, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.write()?;
        guard.remove(&(column, key.to_vec()));
        Ok(())
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let guard = self.read()?;
        let mut results = Vec::new();
        for ((entry_column, key), value) in guard.range((column, prefix.to_vec())..) {
            if *entry_column != column || !key.starts_with(prefix) {
                break;
            }
            results.push((key.clone(), value.clone()));
        }
        Ok(results)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let guard = self.read()?;
        for ((entry_column, key), value) in guard.range((column, prefix.to_vec())..) {
            if *entry_column != column || !key.starts_with(prefix) {
                break;
            }
            visitor(key.as_slice(), value.as_slice())?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut guard = self.write()?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    guard.insert(
                        (*column, key.as_slice().to_vec()),
                        value.as_slice().to_vec(),
                    );
                }
                WriteOp::Delete { column, key } => {
                    guard.remove(&(*column, key.as_slice().to_vec()));
                }
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_scan_stays_inside_column() {
        let store = MemoryStore::new();
        store.put(Column::Coin, b"a1", b"x").expect("put");
        store.put(Column::Coin, b"a2", b"y").expect("put");
        store.put(Column::Coin, b"b1", b"z").expect("put");
        store.put(Column::Meta, b"a3", b"w").expect("put");

        let hits = store.scan_prefix(Column::Coin, b"a").expect("scan");
        assert_eq!(
            hits,
            vec![
                (b"a1".to_vec(), b"x".to_vec()),
                (b"a2".to_vec(), b"y".to_vec())
            ]
        );

        let mut seen = Vec::new();
        store
            .for_each_prefix(Column::Coin, b"", &mut |key, _| {
                seen.push(key.to_vec());
                Ok(())
            })
            .expect("visit");
        assert_eq!(seen, vec![b"a1".to_vec(), b"a2".to_vec(), b"b1".to_vec()]);
    }

    #[test]
    fn clear_empties_every_column() {
        let store = MemoryStore::new();
        store.put(Column::Flag, b"reindexing", &[1]).expect("put");
        store.put(Column::Meta, b"version", &[1]).expect("put");
        assert_eq!(store.len(), 2);
        store.clear().expect("clear");
        assert!(store.is_empty());
    }
}
