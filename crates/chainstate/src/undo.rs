use dualchain_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use dualchain_primitives::OutPoint;

use crate::coins::Coin;

const BLOCK_UNDO_VERSION: u8 = 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpentCoin {
    pub outpoint: OutPoint,
    pub coin: Coin,
}

/// Coins a block consumed, in spend order, so a disconnect can restore them.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockUndo {
    pub spent: Vec<SpentCoin>,
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(BLOCK_UNDO_VERSION);
        encoder.write_varint(self.spent.len() as u64);
        for spent in &self.spent {
            spent.outpoint.consensus_encode(&mut encoder);
            encoder.write_var_bytes(&spent.coin.encode());
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u8()?;
        if version != BLOCK_UNDO_VERSION {
            return Err(DecodeError::InvalidData("unsupported block undo version"));
        }
        let count = decoder.read_count()?;
        let mut spent = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let outpoint = OutPoint::consensus_decode(&mut decoder)?;
            let coin_bytes = decoder.read_var_bytes()?;
            let coin = Coin::decode(&coin_bytes)
                .map_err(|_| DecodeError::InvalidData("invalid coin in undo"))?;
            spent.push(SpentCoin { outpoint, coin });
        }
        decoder.finish()?;
        Ok(Self { spent })
    }
}
