//! Per-network constants: message magic, ports and the genesis block.

use dualchain_primitives::{Block, Hash256, Transaction, TxOut};

pub const COIN: i64 = 100_000_000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Main,
    Test,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Main => "main",
            Network::Test => "test",
            Network::Regtest => "regtest",
        }
    }

    /// Sub-directory of the data directory holding this network's files.
    pub fn data_subdir(self) -> Option<&'static str> {
        match self {
            Network::Main => None,
            Network::Test => Some("testnet3"),
            Network::Regtest => Some("regtest"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub message_start: [u8; 4],
    pub default_port: u16,
    pub rpc_port: u16,
    pub genesis: Block,
    pub genesis_hash: Hash256,
}

pub fn chain_params(network: Network) -> ChainParams {
    let (message_start, default_port, rpc_port, genesis_time) = match network {
        Network::Main => ([0x24, 0xe9, 0x27, 0x64], 16125, 16124, 1_516_980_000),
        Network::Test => ([0xfa, 0x1a, 0xf9, 0xbf], 26125, 26124, 1_516_980_001),
        Network::Regtest => ([0xaa, 0xe8, 0x3f, 0x5f], 16126, 16123, 1_296_688_602),
    };
    let genesis = genesis_block(genesis_time);
    let genesis_hash = genesis.hash();
    ChainParams {
        network,
        message_start,
        default_port,
        rpc_port,
        genesis,
        genesis_hash,
    }
}

fn genesis_block(time: u32) -> Block {
    let reward = TxOut {
        value: 50 * COIN,
        script_pubkey: b"dualchain genesis".to_vec(),
    };
    Block::new([0u8; 32], time, vec![Transaction::coinbase(0, vec![reward])])
}
