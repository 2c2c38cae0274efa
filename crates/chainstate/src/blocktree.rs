//! Block index records, their store, and the in-memory map built from them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dualchain_log::log_info;
use dualchain_primitives::{hash_to_hex, Hash256};
use dualchain_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::flatfiles::FileLocation;

/// Block index record layout written by this build.
pub const BLOCK_INDEX_VERSION: u32 = 1;

pub const STATUS_HAVE_DATA: u32 = 1 << 0;
pub const STATUS_HAVE_UNDO: u32 = 1 << 1;
pub const STATUS_FAILED: u32 = 1 << 2;
/// Data was deleted by pruning after the block was connected.
pub const STATUS_PRUNED: u32 = 1 << 3;

pub const FLAG_TXINDEX: &str = "txindex";
pub const FLAG_PRUNED: &str = "prunedblockfiles";

const ENTRY_LEN_V0: usize = 76;
const ENTRY_LEN_V1: usize = 80;

const META_INDEX_VERSION_KEY: &[u8] = b"index_version";
const META_REINDEX_KEY: &[u8] = b"reindexing";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockIndexEntry {
    pub hash: Hash256,
    pub prev_hash: Hash256,
    pub height: u32,
    pub time: u32,
    pub tx_count: u32,
    pub block: FileLocation,
    pub undo: Option<FileLocation>,
    pub status: u32,
}

impl BlockIndexEntry {
    pub fn has_data(&self) -> bool {
        self.status & STATUS_HAVE_DATA != 0
    }

    pub fn has_undo(&self) -> bool {
        self.status & STATUS_HAVE_UNDO != 0 && self.undo.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.status & STATUS_FAILED != 0
    }

    /// Whether the block can sit on the active chain.
    pub fn is_chain_eligible(&self) -> bool {
        !self.is_failed() && self.status & (STATUS_HAVE_DATA | STATUS_PRUNED) != 0
    }

    pub fn encode(&self) -> [u8; ENTRY_LEN_V1] {
        let mut out = [0u8; ENTRY_LEN_V1];
        out[..ENTRY_LEN_V0].copy_from_slice(&self.encode_fields());
        out[76..80].copy_from_slice(&self.status.to_le_bytes());
        out
    }

    /// Pre-status layout, kept for writing fixtures and for the upgrade path.
    pub fn encode_legacy(&self) -> [u8; ENTRY_LEN_V0] {
        self.encode_fields()
    }

    fn encode_fields(&self) -> [u8; ENTRY_LEN_V0] {
        let mut out = [0u8; ENTRY_LEN_V0];
        out[0..32].copy_from_slice(&self.prev_hash);
        out[32..36].copy_from_slice(&self.height.to_le_bytes());
        out[36..40].copy_from_slice(&self.time.to_le_bytes());
        out[40..44].copy_from_slice(&self.tx_count.to_le_bytes());
        out[44..60].copy_from_slice(&self.block.encode());
        if let Some(undo) = self.undo {
            out[60..76].copy_from_slice(&undo.encode());
        }
        out
    }

    pub fn decode(hash: Hash256, bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ENTRY_LEN_V0 && bytes.len() != ENTRY_LEN_V1 {
            return None;
        }
        let prev_hash: Hash256 = bytes[0..32].try_into().ok()?;
        let height = u32::from_le_bytes(bytes[32..36].try_into().ok()?);
        let time = u32::from_le_bytes(bytes[36..40].try_into().ok()?);
        let tx_count = u32::from_le_bytes(bytes[40..44].try_into().ok()?);
        let block = FileLocation::decode(&bytes[44..60])?;
        let undo = FileLocation::decode(&bytes[60..76]).filter(|location| location.len != 0);
        let status = if bytes.len() == ENTRY_LEN_V1 {
            u32::from_le_bytes(bytes[76..80].try_into().ok()?)
        } else {
            let mut status = 0;
            if block.len != 0 {
                status |= STATUS_HAVE_DATA;
            }
            if undo.is_some() {
                status |= STATUS_HAVE_UNDO;
            }
            status
        };
        Some(Self {
            hash,
            prev_hash,
            height,
            time,
            tx_count,
            block,
            undo,
            status,
        })
    }

    pub fn is_legacy_encoding(bytes: &[u8]) -> bool {
        bytes.len() == ENTRY_LEN_V0
    }
}

const TX_LOCATION_LEN: usize = 20;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxLocation {
    pub block: FileLocation,
    pub index: u32,
}

impl TxLocation {
    pub fn encode(&self) -> [u8; TX_LOCATION_LEN] {
        let mut out = [0u8; TX_LOCATION_LEN];
        out[0..16].copy_from_slice(&self.block.encode());
        out[16..20].copy_from_slice(&self.index.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != TX_LOCATION_LEN {
            return None;
        }
        let block = FileLocation::decode(&bytes[0..16])?;
        let index = u32::from_le_bytes(bytes[16..20].try_into().ok()?);
        Some(Self { block, index })
    }
}

pub struct BlockTree {
    store: Arc<dyn KeyValueStore>,
    version: AtomicU32,
}

impl BlockTree {
    pub fn open(store: Arc<dyn KeyValueStore>) -> Result<Self, StoreError> {
        let version = match store.get(Column::Meta, META_INDEX_VERSION_KEY)? {
            Some(bytes) => {
                let raw: [u8; 4] = bytes.as_slice().try_into().map_err(|_| {
                    StoreError::Corruption("block index version has wrong length".to_string())
                })?;
                u32::from_le_bytes(raw)
            }
            None if column_is_empty(store.as_ref(), Column::BlockIndex)? => {
                store.put(
                    Column::Meta,
                    META_INDEX_VERSION_KEY,
                    &BLOCK_INDEX_VERSION.to_le_bytes(),
                )?;
                BLOCK_INDEX_VERSION
            }
            None => 0,
        };
        Ok(Self {
            store,
            version: AtomicU32::new(version),
        })
    }

    pub fn stored_version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn entry(&self, hash: &Hash256) -> Result<Option<BlockIndexEntry>, StoreError> {
        match self.store.get(Column::BlockIndex, hash)? {
            Some(bytes) => decode_entry(hash, &bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn put_entry(&self, entry: &BlockIndexEntry) -> Result<(), StoreError> {
        self.store
            .put(Column::BlockIndex, &entry.hash, &entry.encode())
    }

    pub fn put_entries<'a>(
        &self,
        entries: impl IntoIterator<Item = &'a BlockIndexEntry>,
    ) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        for entry in entries {
            batch.put(Column::BlockIndex, entry.hash, entry.encode());
        }
        self.store.write_batch(&batch)
    }

    pub fn load_entries(&self) -> Result<Vec<BlockIndexEntry>, StoreError> {
        let mut entries = Vec::new();
        self.store
            .for_each_prefix(Column::BlockIndex, &[], &mut |key: &[u8], value: &[u8]| {
                let hash: Hash256 = key.try_into().map_err(|_| {
                    StoreError::Corruption("block index key has wrong length".to_string())
                })?;
                entries.push(decode_entry(&hash, value)?);
                Ok(())
            })?;
        Ok(entries)
    }

    /// Rewrites every pre-status record. Returns how many changed.
    pub fn upgrade_legacy_entries(&self) -> Result<usize, StoreError> {
        if self.stored_version() >= BLOCK_INDEX_VERSION {
            return Ok(0);
        }
        log_info!("Upgrading block index to v{}", BLOCK_INDEX_VERSION);
        let mut batch = WriteBatch::new();
        let mut upgraded = 0usize;
        self.store
            .for_each_prefix(Column::BlockIndex, &[], &mut |key: &[u8], value: &[u8]| {
                if !BlockIndexEntry::is_legacy_encoding(value) {
                    return Ok(());
                }
                let hash: Hash256 = key.try_into().map_err(|_| {
                    StoreError::Corruption("block index key has wrong length".to_string())
                })?;
                let entry = decode_entry(&hash, value)?;
                batch.put(Column::BlockIndex, hash, entry.encode());
                upgraded += 1;
                Ok(())
            })?;
        batch.put(
            Column::Meta,
            META_INDEX_VERSION_KEY,
            BLOCK_INDEX_VERSION.to_le_bytes(),
        );
        self.store.write_batch(&batch)?;
        self.version.store(BLOCK_INDEX_VERSION, Ordering::Release);
        Ok(upgraded)
    }

    pub fn write_reindexing(&self, reindexing: bool) -> Result<(), StoreError> {
        if reindexing {
            self.store.put(Column::Meta, META_REINDEX_KEY, &[1])
        } else {
            self.store.delete(Column::Meta, META_REINDEX_KEY)
        }
    }

    pub fn is_reindexing(&self) -> Result<bool, StoreError> {
        Ok(self.store.get(Column::Meta, META_REINDEX_KEY)?.is_some())
    }

    pub fn write_flag(&self, name: &str, value: bool) -> Result<(), StoreError> {
        self.store
            .put(Column::Flag, name.as_bytes(), &[u8::from(value)])
    }

    pub fn read_flag(&self, name: &str) -> Result<Option<bool>, StoreError> {
        match self.store.get(Column::Flag, name.as_bytes())? {
            Some(bytes) => match bytes.as_slice() {
                [value] => Ok(Some(*value != 0)),
                _ => Err(StoreError::Corruption(format!("flag {name} has wrong length"))),
            },
            None => Ok(None),
        }
    }

    pub fn put_tx_locations(
        &self,
        locations: impl IntoIterator<Item = (Hash256, TxLocation)>,
    ) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        for (txid, location) in locations {
            batch.put(Column::TxIndex, txid, location.encode());
        }
        self.store.write_batch(&batch)
    }

    pub fn tx_location(&self, txid: &Hash256) -> Result<Option<TxLocation>, StoreError> {
        let Some(bytes) = self.store.get(Column::TxIndex, txid)? else {
            return Ok(None);
        };
        TxLocation::decode(&bytes)
            .ok_or_else(|| StoreError::Corruption("invalid tx index entry".to_string()))
            .map(Some)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.store.flush()
    }
}

fn decode_entry(hash: &Hash256, bytes: &[u8]) -> Result<BlockIndexEntry, StoreError> {
    BlockIndexEntry::decode(*hash, bytes).ok_or_else(|| {
        StoreError::Corruption(format!("block index entry {}", hash_to_hex(hash)))
    })
}

fn column_is_empty(store: &dyn KeyValueStore, column: Column) -> Result<bool, StoreError> {
    let mut seen = false;
    let walk = store.for_each_prefix(column, &[], &mut |_: &[u8], _: &[u8]| {
        seen = true;
        Err(StoreError::Backend("stop".to_string()))
    });
    match walk {
        Ok(()) => Ok(true),
        Err(_) if seen => Ok(false),
        Err(err) => Err(err),
    }
}

/// Every known block, keyed by hash.
#[derive(Clone, Debug, Default)]
pub struct BlockIndex {
    entries: HashMap<Hash256, BlockIndexEntry>,
}

impl BlockIndex {
    pub fn from_entries(entries: impl IntoIterator<Item = BlockIndexEntry>) -> Self {
        Self {
            entries: entries.into_iter().map(|entry| (entry.hash, entry)).collect(),
        }
    }

    pub fn insert(&mut self, entry: BlockIndexEntry) {
        self.entries.insert(entry.hash, entry);
    }

    pub fn get(&self, hash: &Hash256) -> Option<&BlockIndexEntry> {
        self.entries.get(hash)
    }

    pub fn get_mut(&mut self, hash: &Hash256) -> Option<&mut BlockIndexEntry> {
        self.entries.get_mut(hash)
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockIndexEntry> {
        self.entries.values()
    }

    /// Hashes from the genesis block up to and including `tip`, or `None` when the
    /// ancestry is incomplete.
    pub fn path_to(&self, tip: &Hash256) -> Option<Vec<Hash256>> {
        let mut path = Vec::new();
        let mut cursor = self.entries.get(tip)?;
        loop {
            path.push(cursor.hash);
            if cursor.height == 0 {
                if cursor.prev_hash != [0u8; 32] {
                    return None;
                }
                break;
            }
            let parent = self.entries.get(&cursor.prev_hash)?;
            if parent.height + 1 != cursor.height {
                return None;
            }
            cursor = parent;
        }
        path.reverse();
        Some(path)
    }

    /// Highest block whose whole ancestry is eligible. Ties keep `prefer` when it is one
    /// of the candidates, otherwise the lowest hash wins.
    pub fn best_candidate(&self, prefer: Option<&Hash256>) -> Option<&BlockIndexEntry> {
        let mut by_height: Vec<&BlockIndexEntry> = self.entries.values().collect();
        by_height.sort_by_key(|entry| entry.height);
        let mut eligible: HashMap<Hash256, bool> = HashMap::with_capacity(by_height.len());
        let mut best: Option<&BlockIndexEntry> = None;
        for entry in by_height {
            let ancestry_ok = if entry.height == 0 {
                entry.prev_hash == [0u8; 32]
            } else {
                eligible.get(&entry.prev_hash).copied().unwrap_or(false)
            };
            let ok = ancestry_ok && entry.is_chain_eligible();
            eligible.insert(entry.hash, ok);
            if !ok {
                continue;
            }
            best = match best {
                None => Some(entry),
                Some(current) if entry.height > current.height => Some(entry),
                Some(current) if entry.height == current.height => {
                    if prefer == Some(&current.hash) {
                        Some(current)
                    } else if prefer == Some(&entry.hash) || entry.hash < current.hash {
                        Some(entry)
                    } else {
                        Some(current)
                    }
                }
                keep => keep,
            };
        }
        best
    }
}
