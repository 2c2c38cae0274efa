#![cfg(feature = "fjall")]

use std::collections::HashSet;

use dualchain_storage::fjall::{FjallOptions, FjallStore};
use dualchain_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn fjall_smoke_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("chainstate");

    let store = FjallStore::open(&path).expect("open fjall");
    store.put(Column::Meta, b"key", b"value").expect("put");
    assert_eq!(
        store.get(Column::Meta, b"key").expect("get"),
        Some(b"value".to_vec())
    );

    store.put(Column::Coin, b"prefix:1", b"a").expect("put prefix");
    store.put(Column::Coin, b"prefix:2", b"b").expect("put prefix");
    let mut keys = HashSet::new();
    for (key, value) in store.scan_prefix(Column::Coin, b"prefix:").expect("scan") {
        keys.insert((key, value));
    }
    assert_eq!(
        keys,
        HashSet::from([
            (b"prefix:1".to_vec(), b"a".to_vec()),
            (b"prefix:2".to_vec(), b"b".to_vec()),
        ])
    );

    let mut batch = WriteBatch::new();
    batch.put(Column::Meta, b"batch", b"ok");
    batch.delete(Column::Meta, b"key");
    store.write_batch(&batch).expect("batch commit");
    store.flush().expect("flush");

    assert!(store.get(Column::Meta, b"key").expect("get").is_none());
    assert_eq!(
        store.get(Column::Meta, b"batch").expect("get"),
        Some(b"ok".to_vec())
    );
}

#[test]
fn fjall_reopen_sees_flushed_data_and_destroy_wipes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("witstate");

    {
        let store = FjallStore::open_with_options(&path, FjallOptions::with_cache_bytes(1 << 20))
            .expect("open fjall");
        store.put(Column::Flag, b"txindex", &[1]).expect("put");
        store.flush().expect("flush");
    }

    {
        let store = FjallStore::open(&path).expect("reopen fjall");
        assert_eq!(
            store.get(Column::Flag, b"txindex").expect("get"),
            Some(vec![1])
        );
    }

    FjallStore::destroy(&path).expect("destroy");
    assert!(!path.exists());
    FjallStore::destroy(&path).expect("destroy twice");

    let store = FjallStore::open(&path).expect("open fresh");
    assert!(store.get(Column::Flag, b"txindex").expect("get").is_none());
}
