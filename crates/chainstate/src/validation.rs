//! Block acceptance and chain activation against the dual coin views.
//!
//! The reference validator checks block linkage, merkle commitment, coinbase placement
//! and spend existence. Script and proof-of-work rules are not evaluated.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use dualchain_log::{log_debug, log_info, log_warn};
use dualchain_primitives::block::merkle_root;
use dualchain_primitives::encoding::DecodeError;
use dualchain_primitives::{hash_to_hex, Block, Hash256, OutPoint};
use dualchain_storage::StoreError;

use crate::blockfiles::BlockFiles;
use crate::blocktree::{
    BlockIndex, BlockIndexEntry, BlockTree, TxLocation, FLAG_PRUNED, FLAG_TXINDEX,
    STATUS_FAILED, STATUS_HAVE_DATA, STATUS_HAVE_UNDO, STATUS_PRUNED,
};
use crate::cache::CoinsTip;
use crate::coins::Coin;
use crate::flatfiles::{FileLocation, FlatFileError, RecordScanner};
use crate::handle::ChainStateHandle;
use crate::interrupt::InterruptToken;
use crate::params::ChainParams;
use crate::store::ChainStateStore;
use crate::undo::{BlockUndo, SpentCoin};
use crate::ChainStateError;

/// Blocks this close to the tip are never pruned.
pub const MIN_BLOCKS_TO_KEEP: u32 = 288;

#[derive(Debug)]
pub enum ValidationError {
    Store(StoreError),
    FlatFile(FlatFileError),
    Decode(DecodeError),
    ChainState(ChainStateError),
    UnknownBlock(Hash256),
    UnknownTip(Hash256),
    MissingBlockData(Hash256),
    MissingUndo(Hash256),
    MissingInput { block: Hash256, outpoint: OutPoint },
    InvalidBlock { block: Hash256, reason: &'static str },
    Inconsistent(String),
}

impl ValidationError {
    /// The block itself is bad, as opposed to our storage.
    pub fn is_block_invalid(&self) -> bool {
        matches!(
            self,
            ValidationError::MissingInput { .. } | ValidationError::InvalidBlock { .. }
        )
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::Store(err) => write!(f, "{err}"),
            ValidationError::FlatFile(err) => write!(f, "{err}"),
            ValidationError::Decode(err) => write!(f, "{err}"),
            ValidationError::ChainState(err) => write!(f, "{err}"),
            ValidationError::UnknownBlock(hash) => {
                write!(f, "block {} is not in the block index", hash_to_hex(hash))
            }
            ValidationError::UnknownTip(hash) => write!(
                f,
                "chain state best block {} is not in the block index",
                hash_to_hex(hash)
            ),
            ValidationError::MissingBlockData(hash) => {
                write!(f, "block data for {} is not available", hash_to_hex(hash))
            }
            ValidationError::MissingUndo(hash) => {
                write!(f, "undo data for {} is not available", hash_to_hex(hash))
            }
            ValidationError::MissingInput { block, outpoint } => write!(
                f,
                "block {} spends missing output {}:{}",
                hash_to_hex(block),
                hash_to_hex(&outpoint.hash),
                outpoint.index
            ),
            ValidationError::InvalidBlock { block, reason } => {
                write!(f, "block {} is invalid: {reason}", hash_to_hex(block))
            }
            ValidationError::Inconsistent(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<StoreError> for ValidationError {
    fn from(err: StoreError) -> Self {
        ValidationError::Store(err)
    }
}

impl From<FlatFileError> for ValidationError {
    fn from(err: FlatFileError) -> Self {
        ValidationError::FlatFile(err)
    }
}

impl From<DecodeError> for ValidationError {
    fn from(err: DecodeError) -> Self {
        ValidationError::Decode(err)
    }
}

impl From<ChainStateError> for ValidationError {
    fn from(err: ChainStateError) -> Self {
        ValidationError::ChainState(err)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ImportStats {
    pub records: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub orphans_pending: usize,
    pub interrupted: bool,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ActivationReport {
    pub connected: u32,
    pub disconnected: u32,
    pub invalidated: u32,
    pub interrupted: bool,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VerifyReport {
    pub checked: u32,
    pub level: u32,
    pub stopped_at_pruned: bool,
    pub interrupted: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RewindOutcome {
    NotNeeded,
    Rewound { disconnected: u32 },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChainTip {
    pub hash: Hash256,
    pub height: u32,
    pub time: u32,
}

/// What the node needs from consensus during startup and import.
pub trait BlockValidator: Send + Sync {
    /// Reads magic-framed blocks from `source`. `file_position` names the local block
    /// file being rescanned, in which case records are indexed where they already are
    /// instead of being copied.
    fn load_external_block_file(
        &self,
        source: &mut dyn Read,
        file_position: Option<u32>,
        interrupt: &InterruptToken,
    ) -> Result<ImportStats, ValidationError>;

    fn activate_best_chain(
        &self,
        interrupt: &InterruptToken,
    ) -> Result<ActivationReport, ValidationError>;

    /// `depth == 0` checks every block back to genesis.
    fn verify_recent_blocks(
        &self,
        depth: u32,
        level: u32,
        interrupt: &InterruptToken,
    ) -> Result<VerifyReport, ValidationError>;

    fn rewind_block_index(&self) -> Result<RewindOutcome, ValidationError>;

    /// Writes the genesis block when the index is empty and not reindexing. Returns
    /// whether anything was written.
    fn init_block_index(&self) -> Result<bool, ValidationError>;

    fn chain_tip(&self) -> Option<ChainTip>;
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ValidatorOptions {
    pub txindex: bool,
    /// Automatic pruning target. `None` keeps every block file.
    pub prune_target_bytes: Option<u64>,
}

struct Resources {
    tree: Arc<BlockTree>,
    files: Arc<BlockFiles>,
    handle: Arc<ChainStateHandle>,
    witness: Arc<CoinsTip>,
}

impl Resources {
    fn main(&self) -> &CoinsTip {
        self.handle.main()
    }
}

struct PendingBlock {
    block: Block,
    location: Option<FileLocation>,
}

#[derive(Default)]
struct ValidatorState {
    tree_identity: Weak<BlockTree>,
    index: BlockIndex,
    orphans: HashMap<Hash256, Vec<PendingBlock>>,
}

enum Acceptance {
    Accepted,
    Duplicate,
    Orphaned,
    Rejected,
}

pub struct ChainValidator {
    store: Arc<ChainStateStore>,
    params: ChainParams,
    options: ValidatorOptions,
    state: Mutex<ValidatorState>,
    tip: RwLock<Option<ChainTip>>,
}

impl ChainValidator {
    pub fn new(store: Arc<ChainStateStore>, params: ChainParams, options: ValidatorOptions) -> Self {
        Self {
            store,
            params,
            options,
            state: Mutex::new(ValidatorState::default()),
            tip: RwLock::new(None),
        }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn block_index_len(&self) -> Result<usize, ValidationError> {
        let res = self.resources()?;
        let state = self.lock_state(&res)?;
        Ok(state.index.len())
    }

    fn resources(&self) -> Result<Resources, ValidationError> {
        let tree = self.store.block_tree().ok_or(ChainStateError::NotLoaded)?;
        let files = self.store.block_files().ok_or(ChainStateError::NotLoaded)?;
        let handle = self.store.handle().ok_or(ChainStateError::NotLoaded)?;
        let witness = handle.require_witness()?;
        Ok(Resources {
            tree,
            files,
            handle,
            witness,
        })
    }

    /// Takes the validation lock, reloading the in-memory index whenever the store was
    /// reconstructed underneath us.
    fn lock_state(&self, res: &Resources) -> Result<MutexGuard<'_, ValidatorState>, ValidationError> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = state
            .tree_identity
            .upgrade()
            .map(|tree| Arc::ptr_eq(&tree, &res.tree))
            .unwrap_or(false);
        if !current {
            let entries = res.tree.load_entries()?;
            log_debug!("Loaded {} block index entries", entries.len());
            state.index = BlockIndex::from_entries(entries);
            state.tree_identity = Arc::downgrade(&res.tree);
            state.orphans.clear();
            self.refresh_tip(res, &state);
        }
        Ok(state)
    }

    fn refresh_tip(&self, res: &Resources, state: &ValidatorState) {
        let tip = res.main().best_block().and_then(|hash| {
            state.index.get(&hash).map(|entry| ChainTip {
                hash,
                height: entry.height,
                time: entry.time,
            })
        });
        *self.tip.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = tip;
    }

    fn read_block(&self, res: &Resources, entry: &BlockIndexEntry) -> Result<Block, ValidationError> {
        if !entry.has_data() {
            return Err(ValidationError::MissingBlockData(entry.hash));
        }
        let bytes = res.files.read_block(entry.block)?;
        Ok(Block::from_bytes(&bytes)?)
    }

    fn accept_block(
        &self,
        res: &Resources,
        state: &mut ValidatorState,
        block: Block,
        location: Option<FileLocation>,
    ) -> Result<Acceptance, ValidationError> {
        let hash = block.hash();
        if state.index.get(&hash).map(|entry| entry.has_data()).unwrap_or(false) {
            return Ok(Acceptance::Duplicate);
        }
        let prev = block.header.prev_block;
        let height = if prev == [0u8; 32] {
            if hash != self.params.genesis_hash {
                log_warn!(
                    "Ignoring block {} that claims to be a genesis block",
                    hash_to_hex(&hash)
                );
                return Ok(Acceptance::Rejected);
            }
            0
        } else {
            match state.index.get(&prev) {
                Some(parent) => parent.height + 1,
                None => {
                    state
                        .orphans
                        .entry(prev)
                        .or_default()
                        .push(PendingBlock { block, location });
                    return Ok(Acceptance::Orphaned);
                }
            }
        };
        if let Err(reason) = check_block_structure(&block) {
            log_warn!("Rejecting block {}: {reason}", hash_to_hex(&hash));
            return Ok(Acceptance::Rejected);
        }
        let location = match location {
            Some(location) => location,
            None => res.files.append_block(&block.to_bytes())?,
        };
        let entry = BlockIndexEntry {
            hash,
            prev_hash: prev,
            height,
            time: block.header.time,
            tx_count: block.transactions.len() as u32,
            block: location,
            undo: None,
            status: STATUS_HAVE_DATA,
        };
        res.tree.put_entry(&entry)?;
        state.index.insert(entry);
        Ok(Acceptance::Accepted)
    }

    fn accept_with_orphans(
        &self,
        res: &Resources,
        state: &mut ValidatorState,
        block: Block,
        location: Option<FileLocation>,
        stats: &mut ImportStats,
    ) -> Result<(), ValidationError> {
        let mut queue = vec![PendingBlock { block, location }];
        while let Some(pending) = queue.pop() {
            let hash = pending.block.hash();
            match self.accept_block(res, state, pending.block, pending.location)? {
                Acceptance::Accepted => {
                    stats.accepted += 1;
                    if let Some(children) = state.orphans.remove(&hash) {
                        queue.extend(children);
                    }
                }
                Acceptance::Duplicate => stats.duplicates += 1,
                Acceptance::Rejected => stats.rejected += 1,
                Acceptance::Orphaned => {}
            }
        }
        Ok(())
    }

    fn connect_block(
        &self,
        res: &Resources,
        state: &mut ValidatorState,
        hash: &Hash256,
    ) -> Result<(), ValidationError> {
        let mut entry = *state
            .index
            .get(hash)
            .ok_or(ValidationError::UnknownBlock(*hash))?;
        let block = self.read_block(res, &entry)?;
        if block.hash() != *hash {
            return Err(ValidationError::Inconsistent(format!(
                "block data at {:?} does not hash to {}",
                entry.block,
                hash_to_hex(hash)
            )));
        }
        let main = res.main();
        let expected_prev = (entry.height > 0).then_some(entry.prev_hash);
        if main.best_block() != expected_prev {
            return Err(ValidationError::Inconsistent(format!(
                "block {} does not extend the chain state tip",
                hash_to_hex(hash)
            )));
        }

        let mut created = HashSet::new();
        let mut spent = HashSet::new();
        for tx in &block.transactions {
            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    if !spent.insert(*input) {
                        return Err(ValidationError::InvalidBlock {
                            block: *hash,
                            reason: "output spent twice",
                        });
                    }
                    if !created.contains(input) && !main.have_coin(input) {
                        return Err(ValidationError::MissingInput {
                            block: *hash,
                            outpoint: *input,
                        });
                    }
                }
            }
            let txid = tx.txid();
            for index in 0..tx.outputs.len() {
                created.insert(OutPoint::new(txid, index as u32));
            }
        }

        let mut undo = BlockUndo::default();
        let mut tx_locations = Vec::new();
        for (position, tx) in block.transactions.iter().enumerate() {
            let coinbase = tx.is_coinbase();
            if !coinbase {
                for input in &tx.inputs {
                    let coin = main.spend_coin(input).ok_or_else(|| {
                        ValidationError::Inconsistent(format!(
                            "checked input {}:{} vanished",
                            hash_to_hex(&input.hash),
                            input.index
                        ))
                    })?;
                    if coin.is_witness() {
                        res.witness.spend_coin(input);
                    }
                    undo.spent.push(SpentCoin {
                        outpoint: *input,
                        coin,
                    });
                }
            }
            let txid = tx.txid();
            for (index, output) in tx.outputs.iter().enumerate() {
                let outpoint = OutPoint::new(txid, index as u32);
                let coin = Coin::from_output(output, entry.height, coinbase);
                if coin.is_witness() {
                    res.witness.add_coin(outpoint, coin.clone(), false);
                }
                main.add_coin(outpoint, coin, false);
            }
            if self.options.txindex {
                tx_locations.push((
                    txid,
                    TxLocation {
                        block: entry.block,
                        index: position as u32,
                    },
                ));
            }
        }

        let undo_location = res.files.append_undo(entry.block.file_id, &undo.encode())?;
        entry.undo = Some(undo_location);
        entry.status |= STATUS_HAVE_UNDO;
        res.tree.put_entry(&entry)?;
        if !tx_locations.is_empty() {
            res.tree.put_tx_locations(tx_locations)?;
        }
        state.index.insert(entry);
        main.set_best_block(Some(*hash));
        res.witness.set_best_block(Some(*hash));
        Ok(())
    }

    fn disconnect_block(
        &self,
        res: &Resources,
        state: &mut ValidatorState,
        hash: &Hash256,
    ) -> Result<(), ValidationError> {
        let entry = *state
            .index
            .get(hash)
            .ok_or(ValidationError::UnknownBlock(*hash))?;
        let main = res.main();
        if main.best_block() != Some(*hash) {
            return Err(ValidationError::Inconsistent(format!(
                "cannot disconnect {} which is not the chain state tip",
                hash_to_hex(hash)
            )));
        }
        let block = self.read_block(res, &entry)?;
        let undo_location = entry
            .undo
            .filter(|_| entry.has_undo())
            .ok_or(ValidationError::MissingUndo(*hash))?;
        let undo = BlockUndo::decode(&res.files.read_undo(undo_location)?)?;
        if undo.spent.len() != block.input_count() {
            return Err(ValidationError::Inconsistent(format!(
                "undo data for {} does not match its inputs",
                hash_to_hex(hash)
            )));
        }

        for tx in block.transactions.iter().rev() {
            let txid = tx.txid();
            for (index, output) in tx.outputs.iter().enumerate().rev() {
                let outpoint = OutPoint::new(txid, index as u32);
                if main.spend_coin(&outpoint).is_none() {
                    log_warn!(
                        "Disconnect of {}: output {}:{} already gone",
                        hash_to_hex(hash),
                        hash_to_hex(&txid),
                        index
                    );
                }
                if output.is_witness() {
                    res.witness.spend_coin(&outpoint);
                }
            }
        }
        for spent in undo.spent.into_iter().rev() {
            if spent.coin.is_witness() {
                res.witness.add_coin(spent.outpoint, spent.coin.clone(), true);
            }
            main.add_coin(spent.outpoint, spent.coin, true);
        }

        let new_tip = (entry.height > 0).then_some(entry.prev_hash);
        main.set_best_block(new_tip);
        res.witness.set_best_block(new_tip);
        Ok(())
    }

    fn mark_failed(&self, res: &Resources, state: &mut ValidatorState, hash: &Hash256) -> Result<(), ValidationError> {
        if let Some(entry) = state.index.get_mut(hash) {
            entry.status |= STATUS_FAILED;
            res.tree.put_entry(entry)?;
        }
        Ok(())
    }

    fn flush_if_over_budget(&self, res: &Resources) -> Result<(), ValidationError> {
        let usage = res.main().dynamic_usage() + res.witness.dynamic_usage();
        let budget = res.main().budget_bytes() + res.witness.budget_bytes();
        if usage > budget {
            log_debug!("Coin caches at {usage} bytes exceed {budget}; flushing");
            self.store.flush()?;
        }
        Ok(())
    }

    fn tip_height(&self, res: &Resources, state: &ValidatorState) -> Option<u32> {
        res.main()
            .best_block()
            .and_then(|hash| state.index.get(&hash).map(|entry| entry.height))
    }

    fn prune_block_files(&self, res: &Resources, state: &mut ValidatorState) -> Result<(), ValidationError> {
        let Some(target) = self.options.prune_target_bytes else {
            return Ok(());
        };
        let Some(tip_height) = self.tip_height(res, state) else {
            return Ok(());
        };
        if tip_height < MIN_BLOCKS_TO_KEEP {
            return Ok(());
        }
        let current_file = res.files.current_block_file()?;
        let mut per_file: BTreeMap<u32, (u32, Vec<Hash256>)> = BTreeMap::new();
        for entry in state.index.iter().filter(|entry| entry.has_data()) {
            let slot = per_file.entry(entry.block.file_id).or_insert((0, Vec::new()));
            slot.0 = slot.0.max(entry.height);
            slot.1.push(entry.hash);
        }
        let mut total: u64 = 0;
        for file_id in 0..=current_file {
            total += file_len(&res.files.block_file_path(file_id))?;
            total += file_len(&res.files.undo_file_path(file_id))?;
        }
        let mut changed = Vec::new();
        for (file_id, (max_height, hashes)) in per_file {
            if total <= target {
                break;
            }
            if file_id >= current_file || max_height + MIN_BLOCKS_TO_KEEP > tip_height {
                continue;
            }
            let block_path = res.files.block_file_path(file_id);
            let undo_path = res.files.undo_file_path(file_id);
            let freed = file_len(&block_path)? + file_len(&undo_path)?;
            remove_if_present(&block_path)?;
            remove_if_present(&undo_path)?;
            total = total.saturating_sub(freed);
            log_info!("Pruned block file {file_id} ({freed} bytes)");
            for hash in hashes {
                if let Some(entry) = state.index.get_mut(&hash) {
                    entry.status &= !(STATUS_HAVE_DATA | STATUS_HAVE_UNDO);
                    entry.status |= STATUS_PRUNED;
                    changed.push(*entry);
                }
            }
        }
        if !changed.is_empty() {
            res.tree.put_entries(&changed)?;
            res.tree.write_flag(FLAG_PRUNED, true)?;
        }
        Ok(())
    }
}

impl BlockValidator for ChainValidator {
    fn load_external_block_file(
        &self,
        source: &mut dyn Read,
        file_position: Option<u32>,
        interrupt: &InterruptToken,
    ) -> Result<ImportStats, ValidationError> {
        let res = self.resources()?;
        let mut stats = ImportStats::default();
        {
            let mut state = self.lock_state(&res)?;
            let mut scanner = RecordScanner::new(source, self.params.message_start);
            loop {
                if interrupt.is_interrupted() {
                    stats.interrupted = true;
                    break;
                }
                let Some(record) = scanner.next_record()? else {
                    break;
                };
                stats.records += 1;
                let block = match Block::from_bytes(&record.payload) {
                    Ok(block) => block,
                    Err(err) => {
                        log_warn!("Skipping undecodable block record at {}: {err}", record.offset);
                        stats.rejected += 1;
                        continue;
                    }
                };
                let location = file_position.map(|file_id| FileLocation {
                    file_id,
                    offset: record.offset,
                    len: record.payload.len() as u32,
                });
                self.accept_with_orphans(&res, &mut state, block, location, &mut stats)?;
            }
            stats.orphans_pending = state.orphans.values().map(Vec::len).sum();
            res.tree.flush()?;
        }
        log_info!(
            "Loaded {} blocks from external file ({} records, {} known, {} rejected)",
            stats.accepted,
            stats.records,
            stats.duplicates,
            stats.rejected
        );
        if stats.accepted > 0 && !stats.interrupted {
            self.activate_best_chain(interrupt)?;
        }
        Ok(stats)
    }

    fn activate_best_chain(
        &self,
        interrupt: &InterruptToken,
    ) -> Result<ActivationReport, ValidationError> {
        let res = self.resources()?;
        let mut state = self.lock_state(&res)?;
        let mut report = ActivationReport::default();
        'search: loop {
            let current = res.main().best_block();
            let Some(target) = state.index.best_candidate(current.as_ref()).map(|entry| entry.hash)
            else {
                break;
            };
            if current == Some(target) {
                break;
            }
            let path = state.index.path_to(&target).ok_or_else(|| {
                ValidationError::Inconsistent(format!(
                    "best candidate {} has incomplete ancestry",
                    hash_to_hex(&target)
                ))
            })?;
            let on_path: HashSet<Hash256> = path.iter().copied().collect();

            while let Some(tip) = res.main().best_block() {
                if on_path.contains(&tip) {
                    break;
                }
                self.disconnect_block(&res, &mut state, &tip)?;
                report.disconnected += 1;
            }
            let start = match res.main().best_block() {
                Some(tip) => path
                    .iter()
                    .position(|hash| *hash == tip)
                    .map(|position| position + 1)
                    .unwrap_or(0),
                None => 0,
            };
            for hash in &path[start..] {
                if interrupt.is_interrupted() {
                    report.interrupted = true;
                    break 'search;
                }
                match self.connect_block(&res, &mut state, hash) {
                    Ok(()) => report.connected += 1,
                    Err(err) if err.is_block_invalid() => {
                        log_warn!("{err}");
                        self.mark_failed(&res, &mut state, hash)?;
                        report.invalidated += 1;
                        continue 'search;
                    }
                    Err(err) => return Err(err),
                }
                self.flush_if_over_budget(&res)?;
            }
            break;
        }
        self.refresh_tip(&res, &state);
        self.prune_block_files(&res, &mut state)?;
        if report.connected > 0 || report.disconnected > 0 {
            if let Some(tip) = *self.tip.read().unwrap_or_else(|poisoned| poisoned.into_inner()) {
                log_info!(
                    "Chain tip {} at height {} ({} connected, {} disconnected)",
                    hash_to_hex(&tip.hash),
                    tip.height,
                    report.connected,
                    report.disconnected
                );
            }
        }
        Ok(report)
    }

    fn verify_recent_blocks(
        &self,
        depth: u32,
        level: u32,
        interrupt: &InterruptToken,
    ) -> Result<VerifyReport, ValidationError> {
        let res = self.resources()?;
        let state = self.lock_state(&res)?;
        let mut report = VerifyReport {
            level,
            ..VerifyReport::default()
        };
        let main = res.main();
        let Some(tip) = main.best_block() else {
            return Ok(report);
        };
        let tip_entry = *state.index.get(&tip).ok_or(ValidationError::UnknownTip(tip))?;
        if level >= 3 && res.witness.best_block() != Some(tip) {
            return Err(ValidationError::Inconsistent(
                "witness chain state best block differs from the main view".to_string(),
            ));
        }
        log_info!(
            "Verifying last {} blocks at level {}",
            if depth == 0 { "all".to_string() } else { depth.to_string() },
            level
        );

        let mut spent_later: HashSet<OutPoint> = HashSet::new();
        let mut cursor = Some(tip_entry);
        while let Some(entry) = cursor {
            if depth > 0 && report.checked >= depth {
                break;
            }
            if interrupt.is_interrupted() {
                report.interrupted = true;
                break;
            }
            if !entry.has_data() {
                report.stopped_at_pruned = true;
                break;
            }
            let bytes = res.files.read_block(entry.block)?;
            if level >= 1 {
                let block = Block::from_bytes(&bytes)?;
                if block.hash() != entry.hash {
                    return Err(ValidationError::Inconsistent(format!(
                        "block at height {} does not match its index entry",
                        entry.height
                    )));
                }
                if block.header.merkle_root != merkle_root(&block.transactions) {
                    return Err(ValidationError::InvalidBlock {
                        block: entry.hash,
                        reason: "merkle root mismatch",
                    });
                }
                if level >= 2 {
                    let undo_location = entry
                        .undo
                        .filter(|_| entry.has_undo())
                        .ok_or(ValidationError::MissingUndo(entry.hash))?;
                    let undo = BlockUndo::decode(&res.files.read_undo(undo_location)?)?;
                    if undo.spent.len() != block.input_count() {
                        return Err(ValidationError::Inconsistent(format!(
                            "undo data at height {} does not match the block inputs",
                            entry.height
                        )));
                    }
                }
                if level >= 3 {
                    for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
                        spent_later.extend(tx.inputs.iter().copied());
                    }
                    for tx in &block.transactions {
                        let txid = tx.txid();
                        for (index, output) in tx.outputs.iter().enumerate() {
                            let outpoint = OutPoint::new(txid, index as u32);
                            if spent_later.contains(&outpoint) {
                                continue;
                            }
                            if !main.have_coin(&outpoint)
                                || (output.is_witness() && !res.witness.have_coin(&outpoint))
                            {
                                return Err(ValidationError::Inconsistent(format!(
                                    "unspent output {}:{} from height {} is missing",
                                    hash_to_hex(&txid),
                                    index,
                                    entry.height
                                )));
                            }
                        }
                    }
                }
            }
            report.checked += 1;
            cursor = if entry.height == 0 {
                None
            } else {
                state.index.get(&entry.prev_hash).copied()
            };
        }
        log_info!("Verified {} blocks", report.checked);
        Ok(report)
    }

    fn rewind_block_index(&self) -> Result<RewindOutcome, ValidationError> {
        let res = self.resources()?;
        let mut state = self.lock_state(&res)?;
        let Some(tip) = res.main().best_block() else {
            return Ok(RewindOutcome::NotNeeded);
        };
        let tip_entry = *state.index.get(&tip).ok_or(ValidationError::UnknownTip(tip))?;
        let on_path: HashSet<Hash256> = state
            .index
            .best_candidate(Some(&tip))
            .and_then(|target| state.index.path_to(&target.hash))
            .map(|path| path.into_iter().collect())
            .unwrap_or_default();
        if on_path.contains(&tip) && tip_entry.is_chain_eligible() {
            return Ok(RewindOutcome::NotNeeded);
        }
        let mut disconnected = 0u32;
        while let Some(current) = res.main().best_block() {
            if on_path.contains(&current) {
                break;
            }
            self.disconnect_block(&res, &mut state, &current)?;
            disconnected += 1;
        }
        self.store.flush()?;
        self.refresh_tip(&res, &state);
        log_info!("Rewound chain state by {disconnected} blocks");
        Ok(RewindOutcome::Rewound { disconnected })
    }

    fn init_block_index(&self) -> Result<bool, ValidationError> {
        let res = self.resources()?;
        let mut state = self.lock_state(&res)?;
        if res.tree.is_reindexing()? || !state.index.is_empty() {
            return Ok(false);
        }
        let genesis = &self.params.genesis;
        let location = res.files.append_block(&genesis.to_bytes())?;
        let entry = BlockIndexEntry {
            hash: self.params.genesis_hash,
            prev_hash: [0u8; 32],
            height: 0,
            time: genesis.header.time,
            tx_count: genesis.transactions.len() as u32,
            block: location,
            undo: None,
            status: STATUS_HAVE_DATA,
        };
        res.tree.put_entry(&entry)?;
        res.tree.write_flag(FLAG_TXINDEX, self.options.txindex)?;
        res.tree.flush()?;
        state.index.insert(entry);
        log_info!(
            "Initialized block index with genesis {}",
            hash_to_hex(&self.params.genesis_hash)
        );
        Ok(true)
    }

    fn chain_tip(&self) -> Option<ChainTip> {
        *self.tip.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn check_block_structure(block: &Block) -> Result<(), &'static str> {
    let Some(first) = block.transactions.first() else {
        return Err("block has no transactions");
    };
    if !first.is_coinbase() {
        return Err("first transaction is not a coinbase");
    }
    if block.transactions[1..].iter().any(|tx| tx.is_coinbase()) {
        return Err("more than one coinbase");
    }
    if block.header.merkle_root != merkle_root(&block.transactions) {
        return Err("merkle root mismatch");
    }
    Ok(())
}

fn file_len(path: &std::path::Path) -> Result<u64, ValidationError> {
    match std::fs::metadata(path) {
        Ok(metadata) => Ok(metadata.len()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(FlatFileError::Io(err).into()),
    }
}

fn remove_if_present(path: &std::path::Path) -> Result<(), ValidationError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(FlatFileError::Io(err).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt::interrupt_channel;
    use crate::params::{chain_params, Network};
    use crate::store::{CacheBudget, MemoryOpener, StoreLayout, WipeDirective};
    use dualchain_primitives::{Transaction, TxOut, WITNESS_OUTPUT_MARKER};
    use std::io::Cursor;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<ChainStateStore>,
        validator: ChainValidator,
    }

    fn budget() -> CacheBudget {
        CacheBudget {
            block_index_cache_bytes: 1 << 20,
            chain_state_cache_bytes: 2 << 20,
            in_memory_state_cache_bytes: 4 << 20,
            mempool_max_bytes: 0,
        }
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let params = chain_params(Network::Regtest);
        let store = Arc::new(ChainStateStore::new(
            StoreLayout::new(dir.path()),
            Arc::new(MemoryOpener::new()),
            params.message_start,
        ));
        store
            .construct(&budget(), WipeDirective::default())
            .expect("construct");
        let validator = ChainValidator::new(
            Arc::clone(&store),
            params,
            ValidatorOptions {
                txindex: true,
                prune_target_bytes: None,
            },
        );
        assert!(validator.init_block_index().expect("init"));
        validator
            .activate_best_chain(&InterruptToken::never())
            .expect("activate genesis");
        Fixture {
            _dir: dir,
            store,
            validator,
        }
    }

    fn output(script: &[u8]) -> TxOut {
        TxOut {
            value: 50,
            script_pubkey: script.to_vec(),
        }
    }

    fn child(parent: &Block, height: u32, tag: &[u8], spends: &[OutPoint]) -> Block {
        let mut txs = vec![Transaction::coinbase(height, vec![output(tag)])];
        if !spends.is_empty() {
            txs.push(Transaction {
                version: 1,
                inputs: spends.to_vec(),
                outputs: vec![output(b"change")],
                lock_time: 0,
            });
        }
        Block::new(parent.hash(), parent.header.time + 1, txs)
    }

    fn framed(magic: [u8; 4], blocks: &[&Block]) -> Vec<u8> {
        let mut out = Vec::new();
        for block in blocks {
            let bytes = block.to_bytes();
            out.extend_from_slice(&magic);
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&bytes);
        }
        out
    }

    fn import(fx: &Fixture, blocks: &[&Block]) -> ImportStats {
        let bytes = framed(fx.validator.params().message_start, blocks);
        fx.validator
            .load_external_block_file(&mut Cursor::new(bytes), None, &InterruptToken::never())
            .expect("import")
    }

    #[test]
    fn genesis_is_written_once() {
        let fx = fixture();
        assert!(!fx.validator.init_block_index().expect("second init"));
        let tip = fx.validator.chain_tip().expect("tip");
        assert_eq!(tip.hash, fx.validator.params().genesis_hash);
        assert_eq!(tip.height, 0);
        let tree = fx.store.block_tree().expect("tree");
        assert_eq!(tree.read_flag(FLAG_TXINDEX).expect("flag"), Some(true));
    }

    #[test]
    fn witness_outputs_follow_connect_and_spend() {
        let fx = fixture();
        let genesis = fx.validator.params().genesis.clone();
        let witness_script = [WITNESS_OUTPUT_MARKER, 7];
        let b1 = child(&genesis, 1, &witness_script, &[]);
        let witness_coin = OutPoint::new(b1.transactions[0].txid(), 0);
        let b2 = child(&b1, 2, b"plain", &[]);

        let stats = import(&fx, &[&b1, &b2]);
        assert_eq!(stats.accepted, 2);
        let handle = fx.store.handle().expect("handle");
        let witness = handle.require_witness().expect("witness");
        assert!(handle.main().have_coin(&witness_coin));
        assert!(witness.have_coin(&witness_coin));
        let plain = OutPoint::new(b2.transactions[0].txid(), 0);
        assert!(handle.main().have_coin(&plain));
        assert!(!witness.have_coin(&plain));

        let b3 = child(&b2, 3, b"three", &[witness_coin]);
        import(&fx, &[&b3]);
        assert!(!handle.main().have_coin(&witness_coin));
        assert!(!witness.have_coin(&witness_coin));
        assert_eq!(witness.best_block(), Some(b3.hash()));
        assert_eq!(fx.validator.chain_tip().expect("tip").height, 3);

        let tree = fx.store.block_tree().expect("tree");
        let location = tree
            .tx_location(&b3.transactions[1].txid())
            .expect("lookup")
            .expect("indexed");
        assert_eq!(location.index, 1);

        let report = fx
            .validator
            .verify_recent_blocks(0, 3, &InterruptToken::never())
            .expect("verify");
        assert_eq!(report.checked, 4);
    }

    #[test]
    fn orphans_connect_when_parent_arrives() {
        let fx = fixture();
        let genesis = fx.validator.params().genesis.clone();
        let b1 = child(&genesis, 1, b"one", &[]);
        let b2 = child(&b1, 2, b"two", &[]);
        let b3 = child(&b2, 3, b"three", &[]);

        let stats = import(&fx, &[&b3, &b2, &b1, &b1]);
        assert_eq!(stats.records, 4);
        assert_eq!(stats.accepted, 3);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.orphans_pending, 0);
        assert_eq!(fx.validator.chain_tip().expect("tip").hash, b3.hash());
    }

    #[test]
    fn longer_branch_reorganizes_and_restores_spent_coins() {
        let fx = fixture();
        let genesis = fx.validator.params().genesis.clone();
        let a1 = child(&genesis, 1, b"a1", &[]);
        let spendable = OutPoint::new(a1.transactions[0].txid(), 0);
        let a2 = child(&a1, 2, b"a2", &[spendable]);
        import(&fx, &[&a1, &a2]);
        let handle = fx.store.handle().expect("handle");
        assert!(!handle.main().have_coin(&spendable));

        let b2 = child(&a1, 2, b"b2", &[]);
        let b3 = child(&b2, 3, b"b3", &[]);
        import(&fx, &[&b2, &b3]);
        assert_eq!(fx.validator.chain_tip().expect("tip").hash, b3.hash());
        assert!(handle.main().have_coin(&spendable));
        let a2_change = OutPoint::new(a2.transactions[1].txid(), 0);
        assert!(!handle.main().have_coin(&a2_change));
    }

    #[test]
    fn block_spending_unknown_output_is_marked_failed() {
        let fx = fixture();
        let genesis = fx.validator.params().genesis.clone();
        let good = child(&genesis, 1, b"good", &[]);
        let bogus = OutPoint::new([9u8; 32], 0);
        let bad = child(&good, 2, b"bad", &[bogus]);
        let after_bad = child(&bad, 3, b"after", &[]);

        import(&fx, &[&good, &bad, &after_bad]);
        assert_eq!(fx.validator.chain_tip().expect("tip").hash, good.hash());
        let tree = fx.store.block_tree().expect("tree");
        assert!(tree.entry(&bad.hash()).expect("read").expect("entry").is_failed());
    }

    #[test]
    fn structurally_invalid_blocks_are_rejected() {
        let fx = fixture();
        let genesis = fx.validator.params().genesis.clone();
        let mut broken = child(&genesis, 1, b"broken", &[]);
        broken.header.merkle_root = [1u8; 32];
        let stats = import(&fx, &[&broken]);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.accepted, 0);
    }

    #[test]
    fn interrupted_import_stops_before_reading() {
        let fx = fixture();
        let genesis = fx.validator.params().genesis.clone();
        let b1 = child(&genesis, 1, b"one", &[]);
        let (source, token) = interrupt_channel();
        source.interrupt();
        let bytes = framed(fx.validator.params().message_start, &[&b1]);
        let stats = fx
            .validator
            .load_external_block_file(&mut Cursor::new(bytes), None, &token)
            .expect("import");
        assert!(stats.interrupted);
        assert_eq!(stats.records, 0);
    }

    #[test]
    fn state_survives_reconstruct() {
        let fx = fixture();
        let genesis = fx.validator.params().genesis.clone();
        let b1 = child(&genesis, 1, b"one", &[]);
        import(&fx, &[&b1]);
        fx.store.flush().expect("flush");

        fx.store.teardown();
        fx.store
            .construct(&budget(), WipeDirective::default())
            .expect("reconstruct");
        assert_eq!(fx.validator.block_index_len().expect("len"), 2);
        assert_eq!(
            fx.validator.rewind_block_index().expect("rewind"),
            RewindOutcome::NotNeeded
        );
        assert_eq!(fx.validator.chain_tip().expect("tip").hash, b1.hash());
    }

    #[test]
    fn rewind_drops_blocks_marked_failed_after_connect() {
        let fx = fixture();
        let genesis = fx.validator.params().genesis.clone();
        let b1 = child(&genesis, 1, b"one", &[]);
        let b2 = child(&b1, 2, b"two", &[]);
        import(&fx, &[&b1, &b2]);
        fx.store.flush().expect("flush");

        let tree = fx.store.block_tree().expect("tree");
        let mut entry = tree.entry(&b2.hash()).expect("read").expect("entry");
        entry.status |= STATUS_FAILED;
        tree.put_entry(&entry).expect("write");
        fx.store.teardown();
        fx.store
            .construct(&budget(), WipeDirective::default())
            .expect("reconstruct");

        assert_eq!(
            fx.validator.rewind_block_index().expect("rewind"),
            RewindOutcome::Rewound { disconnected: 1 }
        );
        assert_eq!(fx.validator.chain_tip().expect("tip").hash, b1.hash());
    }
}
