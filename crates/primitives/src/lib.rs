//! Block/transaction types and consensus serialization.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod outpoint;
pub mod transaction;

pub type Hash256 = [u8; 32];

pub use block::{Block, BlockHeader};
pub use hash::{hash_to_hex, sha256, sha256d};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxOut, WITNESS_OUTPUT_MARKER};
