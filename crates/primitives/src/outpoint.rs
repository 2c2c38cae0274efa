//! Reference to one output of a previous transaction.

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::Hash256;

pub const OUTPOINT_LEN: usize = 36;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct OutPoint {
    pub hash: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash256, index: u32) -> Self {
        Self { hash, index }
    }

    pub fn null() -> Self {
        Self {
            hash: [0u8; 32],
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.index == u32::MAX && self.hash == [0u8; 32]
    }

    /// Fixed-width key used by the coin columns: txid followed by the LE index.
    pub fn to_key(&self) -> [u8; OUTPOINT_LEN] {
        let mut key = [0u8; OUTPOINT_LEN];
        key[..32].copy_from_slice(&self.hash);
        key[32..].copy_from_slice(&self.index.to_le_bytes());
        key
    }

    pub fn from_key(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != OUTPOINT_LEN {
            return None;
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[..32]);
        let index = u32::from_le_bytes(bytes[32..].try_into().ok()?);
        Some(Self { hash, index })
    }
}

impl Encodable for OutPoint {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_hash(&self.hash);
        encoder.write_u32_le(self.index);
    }
}

impl Decodable for OutPoint {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let hash = decoder.read_hash()?;
        let index = decoder.read_u32_le()?;
        Ok(Self { hash, index })
    }
}
