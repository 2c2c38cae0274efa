//! Dual-view chain state: block files, block index, the main and witness coin views,
//! and the loader that brings them to a verified state.

use std::fmt;

use dualchain_storage::StoreError;

pub mod blockfiles;
pub mod blocktree;
pub mod cache;
pub mod catcher;
pub mod coins;
pub mod flatfiles;
pub mod handle;
pub mod interrupt;
pub mod loader;
pub mod params;
pub mod store;
pub mod undo;
pub mod validation;

use crate::flatfiles::FlatFileError;

pub use handle::ChainStateHandle;
pub use store::{CacheBudget, ChainStateStore, StoreLayout, WipeDirective};

#[derive(Debug)]
pub enum ChainStateError {
    Store(StoreError),
    FlatFile(FlatFileError),
    NotLoaded,
    MissingSibling,
}

impl fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::FlatFile(err) => write!(f, "{err}"),
            ChainStateError::NotLoaded => write!(f, "chain state is not loaded"),
            ChainStateError::MissingSibling => {
                write!(f, "main chain state has no live witness sibling")
            }
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<FlatFileError> for ChainStateError {
    fn from(err: FlatFileError) -> Self {
        ChainStateError::FlatFile(err)
    }
}
