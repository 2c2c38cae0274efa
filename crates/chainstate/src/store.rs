//! Ownership of every chain-state resource behind one structural lock.
//!
//! The slot holds the block-index store, the block/undo files, the main view handle and
//! the witness view. Construction fills it in that order, teardown empties it in the
//! fixed flush, files, main, witness, block-index order. Coin reads never take this lock.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use dualchain_log::{log_debug, log_error, log_info, log_warn};
use dualchain_storage::memory::MemoryStore;
use dualchain_storage::{KeyValueStore, StoreError};

use crate::blockfiles::{cleanup_block_rev_files, BlockFiles, ReindexCleanup};
use crate::blocktree::BlockTree;
use crate::cache::CoinsTip;
use crate::catcher::{abort_on_read_fault, ErrorCatchingView, FatalReadHandler};
use crate::coins::{CoinsViewDb, ViewKind};
use crate::handle::ChainStateHandle;
use crate::ChainStateError;

/// Byte budgets for the caches. Produced once at startup and never changed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CacheBudget {
    pub block_index_cache_bytes: u64,
    pub chain_state_cache_bytes: u64,
    pub in_memory_state_cache_bytes: u64,
    pub mempool_max_bytes: u64,
}

impl CacheBudget {
    pub fn total(&self) -> u64 {
        self.block_index_cache_bytes
            + self.chain_state_cache_bytes
            + self.in_memory_state_cache_bytes
            + self.mempool_max_bytes
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum StoreKind {
    BlockIndex,
    ChainState,
    Witness,
}

impl StoreKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreKind::BlockIndex => "block index",
            StoreKind::ChainState => "chainstate",
            StoreKind::Witness => "witness chainstate",
        }
    }
}

/// Chooses the backend behind each store directory.
pub trait StoreOpener: Send + Sync {
    fn open(
        &self,
        kind: StoreKind,
        path: &Path,
        cache_bytes: u64,
    ) -> Result<Arc<dyn KeyValueStore>, StoreError>;

    /// Removes everything stored at `path`. The store must not be open.
    fn destroy(&self, kind: StoreKind, path: &Path) -> Result<(), StoreError>;
}

/// Process-local stores keyed by path, so a reopen sees earlier writes.
#[derive(Default)]
pub struct MemoryOpener {
    stores: Mutex<HashMap<PathBuf, Arc<MemoryStore>>>,
}

impl MemoryOpener {
    pub fn new() -> Self {
        Self::default()
    }

    fn stores(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<MemoryStore>>> {
        self.stores.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StoreOpener for MemoryOpener {
    fn open(
        &self,
        _kind: StoreKind,
        path: &Path,
        _cache_bytes: u64,
    ) -> Result<Arc<dyn KeyValueStore>, StoreError> {
        let store = Arc::clone(
            self.stores()
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(MemoryStore::new())),
        );
        Ok(store)
    }

    fn destroy(&self, _kind: StoreKind, path: &Path) -> Result<(), StoreError> {
        self.stores().remove(path);
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoreLayout {
    pub data_dir: PathBuf,
    pub blocks_dir: PathBuf,
    pub index_dir: PathBuf,
    pub chainstate_dir: PathBuf,
    pub witness_dir: PathBuf,
}

impl StoreLayout {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let blocks_dir = data_dir.join("blocks");
        Self {
            index_dir: blocks_dir.join("index"),
            blocks_dir,
            chainstate_dir: data_dir.join("chainstate"),
            witness_dir: data_dir.join("witstate"),
            data_dir,
        }
    }
}

/// Which stores `construct` recreates from scratch.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WipeDirective {
    pub block_index: bool,
    pub chain_state: bool,
}

impl WipeDirective {
    pub fn any(&self) -> bool {
        self.block_index || self.chain_state
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TeardownReport {
    pub flushed: bool,
    pub closed_block_files: bool,
    pub released_main: bool,
    pub released_witness: bool,
    pub released_block_tree: bool,
    pub flush_error: Option<String>,
}

impl TeardownReport {
    pub fn is_noop(&self) -> bool {
        !(self.flushed
            || self.closed_block_files
            || self.released_main
            || self.released_witness
            || self.released_block_tree)
    }
}

#[derive(Debug)]
pub enum SchemaUpgradeError {
    NotLoaded,
    Store {
        view: ViewKind,
        error: StoreError,
    },
    BlockIndex(StoreError),
}

impl fmt::Display for SchemaUpgradeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaUpgradeError::NotLoaded => write!(f, "chain state is not loaded"),
            SchemaUpgradeError::Store { view, error } => {
                write!(f, "failed to upgrade {} database: {error}", view.as_str())
            }
            SchemaUpgradeError::BlockIndex(error) => {
                write!(f, "failed to upgrade block index: {error}")
            }
        }
    }
}

impl std::error::Error for SchemaUpgradeError {}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct UpgradeReport {
    pub main_coins: usize,
    pub witness_coins: usize,
}

#[derive(Default)]
struct StoreSlot {
    block_tree: Option<Arc<BlockTree>>,
    block_files: Option<Arc<BlockFiles>>,
    witness: Option<Arc<CoinsTip>>,
    handle: Option<Arc<ChainStateHandle>>,
}

impl StoreSlot {
    fn is_empty(&self) -> bool {
        self.block_tree.is_none()
            && self.block_files.is_none()
            && self.witness.is_none()
            && self.handle.is_none()
    }
}

pub struct ChainStateStore {
    layout: StoreLayout,
    opener: Arc<dyn StoreOpener>,
    magic: [u8; 4],
    on_fatal: FatalReadHandler,
    budget: Mutex<CacheBudget>,
    slot: Mutex<StoreSlot>,
}

impl ChainStateStore {
    pub fn new(layout: StoreLayout, opener: Arc<dyn StoreOpener>, magic: [u8; 4]) -> Self {
        Self {
            layout,
            opener,
            magic,
            on_fatal: abort_on_read_fault,
            budget: Mutex::new(CacheBudget::default()),
            slot: Mutex::new(StoreSlot::default()),
        }
    }

    /// Replaces the default abort-on-read-fault policy for views opened afterwards.
    pub fn with_fatal_handler(mut self, on_fatal: FatalReadHandler) -> Self {
        self.on_fatal = on_fatal;
        self
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn cache_budget(&self) -> CacheBudget {
        *self.budget.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn construct(&self, budget: &CacheBudget, wipe: WipeDirective) -> Result<(), ChainStateError> {
        let mut slot = self.lock_slot();
        if !slot.is_empty() {
            log_warn!("Chain state constructed over a live instance; tearing the old one down first");
            Self::teardown_slot(&mut slot);
        }
        *self.budget.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = *budget;

        if wipe.block_index {
            log_info!("Wiping block index at {}", self.layout.index_dir.display());
            self.opener.destroy(StoreKind::BlockIndex, &self.layout.index_dir)?;
        }
        if wipe.chain_state {
            log_info!("Wiping chain state at {}", self.layout.chainstate_dir.display());
            self.opener.destroy(StoreKind::ChainState, &self.layout.chainstate_dir)?;
            self.opener.destroy(StoreKind::Witness, &self.layout.witness_dir)?;
        }

        let index_store = self.opener.open(
            StoreKind::BlockIndex,
            &self.layout.index_dir,
            budget.block_index_cache_bytes,
        )?;
        slot.block_tree = Some(Arc::new(BlockTree::open(index_store)?));

        slot.block_files = Some(Arc::new(BlockFiles::open(&self.layout.blocks_dir, self.magic)?));

        let coins_db_cache = budget.chain_state_cache_bytes / 2;
        let witness_memory = (budget.in_memory_state_cache_bytes / 4) as usize;
        let main_memory = budget.in_memory_state_cache_bytes as usize - witness_memory;

        let witness_store = self.opener.open(
            StoreKind::Witness,
            &self.layout.witness_dir,
            coins_db_cache,
        )?;
        let witness_db = CoinsViewDb::open(witness_store, ViewKind::Witness)?;
        let witness = Arc::new(CoinsTip::new(
            ErrorCatchingView::new(witness_db, ViewKind::Witness, self.on_fatal),
            witness_memory,
        ));
        slot.witness = Some(Arc::clone(&witness));

        let main_store = self.opener.open(
            StoreKind::ChainState,
            &self.layout.chainstate_dir,
            budget.chain_state_cache_bytes - coins_db_cache,
        )?;
        let main_db = CoinsViewDb::open(main_store, ViewKind::Main)?;
        let mut handle = ChainStateHandle::new(CoinsTip::new(
            ErrorCatchingView::new(main_db, ViewKind::Main, self.on_fatal),
            main_memory,
        ));
        Self::set_sibling(&mut handle, &witness);
        slot.handle = Some(Arc::new(handle));

        log_info!(
            "Opened chain state (block index cache {} MiB, coin db cache {} MiB, in-memory {} MiB)",
            budget.block_index_cache_bytes >> 20,
            budget.chain_state_cache_bytes >> 20,
            budget.in_memory_state_cache_bytes >> 20
        );
        Ok(())
    }

    /// Links `witness` as the non-owning sibling of the main view.
    pub fn set_sibling(handle: &mut ChainStateHandle, witness: &Arc<CoinsTip>) {
        handle.link_sibling(witness);
    }

    /// Migrates both coin views to the current schema.
    pub fn upgrade(&self) -> Result<UpgradeReport, SchemaUpgradeError> {
        let (handle, witness) = {
            let slot = self.lock_slot();
            match (slot.handle.clone(), slot.witness.clone()) {
                (Some(handle), Some(witness)) => (handle, witness),
                _ => return Err(SchemaUpgradeError::NotLoaded),
            }
        };
        let main_coins = handle
            .main()
            .db()
            .upgrade()
            .map_err(|error| SchemaUpgradeError::Store {
                view: ViewKind::Main,
                error,
            })?;
        let witness_coins = witness
            .db()
            .upgrade()
            .map_err(|error| SchemaUpgradeError::Store {
                view: ViewKind::Witness,
                error,
            })?;
        Ok(UpgradeReport {
            main_coins,
            witness_coins,
        })
    }

    pub fn upgrade_block_index(&self) -> Result<usize, SchemaUpgradeError> {
        let tree = self.block_tree().ok_or(SchemaUpgradeError::NotLoaded)?;
        let upgraded = tree
            .upgrade_legacy_entries()
            .map_err(SchemaUpgradeError::BlockIndex)?;
        tree.flush().map_err(SchemaUpgradeError::BlockIndex)?;
        Ok(upgraded)
    }

    /// Marks the block index as reindexing. With `pruned`, also drops undo files and
    /// block files past the first numbering gap.
    pub fn prepare_for_reindex(&self, pruned: bool) -> Result<Option<ReindexCleanup>, ChainStateError> {
        let mut slot = self.lock_slot();
        let tree = slot.block_tree.clone().ok_or(ChainStateError::NotLoaded)?;
        tree.write_reindexing(true)?;
        if !pruned {
            return Ok(None);
        }
        if let Some(files) = slot.block_files.take() {
            files.sync()?;
        }
        let cleanup = cleanup_block_rev_files(&self.layout.blocks_dir)?;
        slot.block_files = Some(Arc::new(BlockFiles::open(&self.layout.blocks_dir, self.magic)?));
        Ok(Some(cleanup))
    }

    pub fn flush(&self) -> Result<(), ChainStateError> {
        let slot = self.lock_slot();
        Self::flush_slot(&slot)?;
        Ok(())
    }

    pub fn teardown(&self) -> TeardownReport {
        let mut slot = self.lock_slot();
        Self::teardown_slot(&mut slot)
    }

    pub fn is_loaded(&self) -> bool {
        self.lock_slot().handle.is_some()
    }

    pub fn handle(&self) -> Option<Arc<ChainStateHandle>> {
        self.lock_slot().handle.clone()
    }

    pub fn witness(&self) -> Option<Arc<CoinsTip>> {
        self.lock_slot().witness.clone()
    }

    pub fn block_tree(&self) -> Option<Arc<BlockTree>> {
        self.lock_slot().block_tree.clone()
    }

    pub fn block_files(&self) -> Option<Arc<BlockFiles>> {
        self.lock_slot().block_files.clone()
    }

    /// Resolves a numbered block file under the structural lock. `Ok(None)` when the
    /// file does not exist.
    pub fn open_block_file(&self, file_id: u32) -> Result<Option<File>, ChainStateError> {
        let slot = self.lock_slot();
        let files = slot.block_files.as_ref().ok_or(ChainStateError::NotLoaded)?;
        Ok(files.open_block_file(file_id)?)
    }

    /// Fails if a main view is present without its witness sibling.
    pub fn check_sibling_invariant(&self) -> Result<(), ChainStateError> {
        let slot = self.lock_slot();
        match (&slot.handle, &slot.witness) {
            (Some(handle), Some(witness)) => match handle.witness() {
                Some(linked) if Arc::ptr_eq(&linked, witness) => Ok(()),
                _ => Err(ChainStateError::MissingSibling),
            },
            (Some(_), None) => Err(ChainStateError::MissingSibling),
            _ => Ok(()),
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, StoreSlot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn flush_slot(slot: &StoreSlot) -> Result<bool, ChainStateError> {
        let mut acted = false;
        if let Some(handle) = &slot.handle {
            handle.main().flush()?;
            handle.main().sync()?;
            acted = true;
        }
        if let Some(witness) = &slot.witness {
            witness.flush()?;
            witness.sync()?;
            acted = true;
        }
        if let Some(files) = &slot.block_files {
            files.sync()?;
            acted = true;
        }
        if let Some(tree) = &slot.block_tree {
            tree.flush()?;
            acted = true;
        }
        Ok(acted)
    }

    fn teardown_slot(slot: &mut StoreSlot) -> TeardownReport {
        let mut report = TeardownReport::default();
        match Self::flush_slot(slot) {
            Ok(acted) => report.flushed = acted,
            Err(err) => {
                log_error!("Failed to flush chain state during teardown: {err}");
                report.flush_error = Some(err.to_string());
            }
        }
        if let Some(files) = slot.block_files.take() {
            drop(files);
            report.closed_block_files = true;
        }
        if let Some(handle) = slot.handle.take() {
            if Arc::strong_count(&handle) > 1 {
                log_debug!("Main chain state view still borrowed at release");
            }
            drop(handle);
            report.released_main = true;
        }
        if let Some(witness) = slot.witness.take() {
            drop(witness);
            report.released_witness = true;
        }
        if let Some(tree) = slot.block_tree.take() {
            drop(tree);
            report.released_block_tree = true;
        }
        report
    }
}
