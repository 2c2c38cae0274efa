//! Persistent coin views backed by the storage trait.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dualchain_log::log_info;
use dualchain_primitives::encoding::{DecodeError, Decoder, Encoder};
use dualchain_primitives::{hash_to_hex, Hash256, OutPoint, TxOut, WITNESS_OUTPUT_MARKER};
use dualchain_storage::{Column, KeyValueStore, StoreError, WriteBatch};

/// On-disk coin encoding written by this build.
pub const COINS_SCHEMA_VERSION: u32 = 1;

pub const COIN_FLAG_COINBASE: u8 = 1 << 0;
pub const COIN_FLAG_WITNESS: u8 = 1 << 1;

const META_VERSION_KEY: &[u8] = b"coins_version";
const META_BEST_BLOCK_KEY: &[u8] = b"best_block";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ViewKind {
    Main,
    Witness,
}

impl ViewKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ViewKind::Main => "chainstate",
            ViewKind::Witness => "witness chainstate",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Coin {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
    pub height: u32,
    pub flags: u8,
}

impl Coin {
    pub fn from_output(output: &TxOut, height: u32, coinbase: bool) -> Self {
        let mut flags = 0;
        if coinbase {
            flags |= COIN_FLAG_COINBASE;
        }
        if output.is_witness() {
            flags |= COIN_FLAG_WITNESS;
        }
        Self {
            value: output.value,
            script_pubkey: output.script_pubkey.clone(),
            height,
            flags,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.flags & COIN_FLAG_COINBASE != 0
    }

    pub fn is_witness(&self) -> bool {
        self.flags & COIN_FLAG_WITNESS != 0
    }

    /// Approximate heap plus inline footprint, used for cache accounting.
    pub fn dynamic_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.script_pubkey.capacity()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(17 + self.script_pubkey.len());
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
        encoder.write_u32_le(self.height);
        encoder.write_u8(self.flags);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        let height = decoder.read_u32_le()?;
        let flags = decoder.read_u8()?;
        if flags & !(COIN_FLAG_COINBASE | COIN_FLAG_WITNESS) != 0 {
            return Err(DecodeError::InvalidData("unknown coin flags"));
        }
        decoder.finish()?;
        Ok(Self {
            value,
            script_pubkey,
            height,
            flags,
        })
    }

    /// Version 0 stored a plain coinbase byte and never tracked witness outputs.
    pub fn decode_legacy(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        let height = decoder.read_u32_le()?;
        let coinbase = decoder.read_u8()? != 0;
        decoder.finish()?;
        let mut flags = if coinbase { COIN_FLAG_COINBASE } else { 0 };
        if script_pubkey.first() == Some(&WITNESS_OUTPUT_MARKER) {
            flags |= COIN_FLAG_WITNESS;
        }
        Ok(Self {
            value,
            script_pubkey,
            height,
            flags,
        })
    }

    pub fn encode_legacy(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
        encoder.write_u32_le(self.height);
        encoder.write_u8(u8::from(self.is_coinbase()));
        encoder.into_inner()
    }
}

/// Read side shared by the persistent views and anything layered over them.
pub trait CoinsView: Send + Sync {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError>;

    fn have_coin(&self, outpoint: &OutPoint) -> Result<bool, StoreError> {
        Ok(self.get_coin(outpoint)?.is_some())
    }

    fn best_block(&self) -> Result<Option<Hash256>, StoreError>;
}

pub struct CoinsViewDb {
    store: Arc<dyn KeyValueStore>,
    kind: ViewKind,
    version: AtomicU32,
}

impl CoinsViewDb {
    /// Opens a view, stamping the current schema on a store that has never held a
    /// best block. A store with a best block but no stamp predates versioning.
    pub fn open(store: Arc<dyn KeyValueStore>, kind: ViewKind) -> Result<Self, StoreError> {
        let version = match store.get(Column::Meta, META_VERSION_KEY)? {
            Some(bytes) => decode_version(&bytes)?,
            None => {
                if store.get(Column::Meta, META_BEST_BLOCK_KEY)?.is_some() {
                    0
                } else {
                    store.put(
                        Column::Meta,
                        META_VERSION_KEY,
                        &COINS_SCHEMA_VERSION.to_le_bytes(),
                    )?;
                    COINS_SCHEMA_VERSION
                }
            }
        };
        Ok(Self {
            store,
            kind,
            version: AtomicU32::new(version),
        })
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub fn stored_version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Applies a cache flush: `None` deletes the coin.
    pub fn write_coins<'a>(
        &self,
        changes: impl IntoIterator<Item = (&'a OutPoint, Option<&'a Coin>)>,
        best_block: Option<Hash256>,
    ) -> Result<usize, StoreError> {
        let mut batch = WriteBatch::new();
        for (outpoint, coin) in changes {
            match coin {
                Some(coin) => batch.put(Column::Coin, outpoint.to_key(), coin.encode()),
                None => batch.delete(Column::Coin, outpoint.to_key()),
            }
        }
        let written = batch.len();
        match best_block {
            Some(hash) => batch.put(Column::Meta, META_BEST_BLOCK_KEY, hash),
            None => batch.delete(Column::Meta, META_BEST_BLOCK_KEY),
        }
        self.store.write_batch(&batch)?;
        Ok(written)
    }

    /// Rewrites every legacy coin in the current encoding. Returns how many were touched.
    pub fn upgrade(&self) -> Result<usize, StoreError> {
        if self.stored_version() >= COINS_SCHEMA_VERSION {
            return Ok(0);
        }
        log_info!(
            "Upgrading {} database to coin schema v{}",
            self.kind.as_str(),
            COINS_SCHEMA_VERSION
        );
        let mut batch = WriteBatch::new();
        let mut upgraded = 0usize;
        self.store.for_each_prefix(Column::Coin, &[], &mut |key: &[u8], value: &[u8]| {
            let coin = Coin::decode_legacy(value).map_err(|err| {
                StoreError::Corruption(format!("legacy coin {}: {err}", hex_key(key)))
            })?;
            batch.put(Column::Coin, key, coin.encode());
            upgraded += 1;
            Ok(())
        })?;
        batch.put(
            Column::Meta,
            META_VERSION_KEY,
            COINS_SCHEMA_VERSION.to_le_bytes(),
        );
        self.store.write_batch(&batch)?;
        self.version.store(COINS_SCHEMA_VERSION, Ordering::Release);
        Ok(upgraded)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.store.flush()
    }
}

impl CoinsView for CoinsViewDb {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        let Some(bytes) = self.store.get(Column::Coin, &outpoint.to_key())? else {
            return Ok(None);
        };
        let decoded = if self.stored_version() == 0 {
            Coin::decode_legacy(&bytes)
        } else {
            Coin::decode(&bytes)
        };
        decoded.map(Some).map_err(|err| {
            StoreError::Corruption(format!(
                "coin {}:{}: {err}",
                hash_to_hex(&outpoint.hash),
                outpoint.index
            ))
        })
    }

    fn best_block(&self) -> Result<Option<Hash256>, StoreError> {
        match self.store.get(Column::Meta, META_BEST_BLOCK_KEY)? {
            Some(bytes) => {
                let hash: Hash256 = bytes.as_slice().try_into().map_err(|_| {
                    StoreError::Corruption("best block record has wrong length".to_string())
                })?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }
}

fn decode_version(bytes: &[u8]) -> Result<u32, StoreError> {
    let raw: [u8; 4] = bytes
        .try_into()
        .map_err(|_| StoreError::Corruption("coin schema version has wrong length".to_string()))?;
    Ok(u32::from_le_bytes(raw))
}

fn hex_key(key: &[u8]) -> String {
    key.iter().map(|byte| format!("{byte:02x}")).collect()
}
