//! Minimal transaction model: spent outpoints in, valued scripts out.

use crate::encoding::{decode, encode, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;
use crate::Hash256;

/// First script byte marking an output that the witness view also tracks.
pub const WITNESS_OUTPUT_MARKER: u8 = 0xc7;

const MAX_TX_INPUTS: usize = 100_000;
const MAX_TX_OUTPUTS: usize = 100_000;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn is_witness(&self) -> bool {
        self.script_pubkey.first() == Some(&WITNESS_OUTPUT_MARKER)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<OutPoint>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// Coinbase transactions spend the null outpoint and carry the block height in
    /// `lock_time` so that each one hashes uniquely.
    pub fn coinbase(height: u32, outputs: Vec<TxOut>) -> Self {
        Self {
            version: 1,
            inputs: vec![OutPoint::null()],
            outputs,
            lock_time: height,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_null()
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&encode(self))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode(bytes)
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.consensus_encode(encoder);
        }
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            encoder.write_i64_le(output.value);
            encoder.write_var_bytes(&output.script_pubkey);
        }
        encoder.write_u32_le(self.lock_time);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let input_count = decoder.read_count()?;
        if input_count > MAX_TX_INPUTS {
            return Err(DecodeError::InvalidData("too many transaction inputs"));
        }
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            inputs.push(OutPoint::consensus_decode(decoder)?);
        }
        let output_count = decoder.read_count()?;
        if output_count > MAX_TX_OUTPUTS {
            return Err(DecodeError::InvalidData("too many transaction outputs"));
        }
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            let value = decoder.read_i64_le()?;
            let script_pubkey = decoder.read_var_bytes()?;
            outputs.push(TxOut {
                value,
                script_pubkey,
            });
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coinbase_is_recognised_and_unique_per_height() {
        let out = vec![TxOut {
            value: 50,
            script_pubkey: vec![0x51],
        }];
        let first = Transaction::coinbase(1, out.clone());
        let second = Transaction::coinbase(2, out);
        assert!(first.is_coinbase());
        assert_ne!(first.txid(), second.txid());
    }

    #[test]
    fn witness_marker_is_first_script_byte() {
        let witness = TxOut {
            value: 1,
            script_pubkey: vec![WITNESS_OUTPUT_MARKER, 0x01],
        };
        let plain = TxOut {
            value: 1,
            script_pubkey: vec![0x01, WITNESS_OUTPUT_MARKER],
        };
        assert!(witness.is_witness());
        assert!(!plain.is_witness());
    }
}
