//! Block header and block types.

use crate::encoding::{decode, encode, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::transaction::Transaction;
use crate::Hash256;

pub const CURRENT_VERSION: i32 = 1;
pub const HEADER_LEN: usize = 80;

const MAX_BLOCK_TRANSACTIONS: usize = 1_000_000;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash256 {
        sha256d(&encode(self))
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.prev_block);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash()?,
            merkle_root: decoder.read_hash()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Builds a block on `prev_block` with the merkle root filled in.
    pub fn new(prev_block: Hash256, time: u32, transactions: Vec<Transaction>) -> Self {
        let merkle_root = merkle_root(&transactions);
        Self {
            header: BlockHeader {
                version: CURRENT_VERSION,
                prev_block,
                merkle_root,
                time,
                bits: 0x207f_ffff,
                nonce: 0,
            },
            transactions,
        }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode(bytes)
    }

    pub fn input_count(&self) -> usize {
        self.transactions
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .map(|tx| tx.inputs.len())
            .sum()
    }
}

impl Encodable for Block {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.header.consensus_encode(encoder);
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.consensus_encode(encoder);
        }
    }
}

impl Decodable for Block {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let header = BlockHeader::consensus_decode(decoder)?;
        let count = decoder.read_count()?;
        if count > MAX_BLOCK_TRANSACTIONS {
            return Err(DecodeError::InvalidData("too many block transactions"));
        }
        let mut transactions = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            transactions.push(Transaction::consensus_decode(decoder)?);
        }
        Ok(Self {
            header,
            transactions,
        })
    }
}

/// Bitcoin-style merkle root: pairwise sha256d, duplicating the last node of odd rows.
pub fn merkle_root(transactions: &[Transaction]) -> Hash256 {
    let mut row: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
    if row.is_empty() {
        return [0u8; 32];
    }
    while row.len() > 1 {
        if row.len() % 2 == 1 {
            if let Some(last) = row.last().copied() {
                row.push(last);
            }
        }
        row = row
            .chunks(2)
            .map(|pair| {
                let mut joined = [0u8; 64];
                joined[..32].copy_from_slice(&pair[0]);
                joined[32..].copy_from_slice(&pair[1]);
                sha256d(&joined)
            })
            .collect();
    }
    row[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TxOut;

    #[test]
    fn header_encodes_to_eighty_bytes() {
        let block = Block::new([7u8; 32], 1_600_000_000, Vec::new());
        assert_eq!(encode(&block.header).len(), HEADER_LEN);
    }

    #[test]
    fn merkle_root_commits_to_every_transaction() {
        let txs: Vec<Transaction> = (0..3)
            .map(|height| {
                Transaction::coinbase(
                    height,
                    vec![TxOut {
                        value: 1,
                        script_pubkey: Vec::new(),
                    }],
                )
            })
            .collect();
        let full = merkle_root(&txs);
        let partial = merkle_root(&txs[..2]);
        assert_ne!(full, partial);
        assert_eq!(merkle_root(&txs[..1]), txs[0].txid());
    }

    #[test]
    fn block_bytes_decode_back() {
        let block = Block::new(
            [1u8; 32],
            42,
            vec![Transaction::coinbase(
                5,
                vec![TxOut {
                    value: 10,
                    script_pubkey: vec![0x51],
                }],
            )],
        );
        let decoded = Block::from_bytes(&block.to_bytes()).expect("decode");
        assert_eq!(decoded.hash(), block.hash());
        assert_eq!(decoded, block);
    }
}
