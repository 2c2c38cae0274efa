//! Brings the block index and both coin views from whatever is on disk to a verified,
//! loadable state.

use std::fmt;
use std::sync::Arc;

use dualchain_log::{log_info, log_warn};
use dualchain_primitives::{hash_to_hex, Hash256};

use crate::blocktree::{BlockTree, BLOCK_INDEX_VERSION, FLAG_PRUNED, FLAG_TXINDEX};
use crate::interrupt::InterruptToken;
use crate::store::{CacheBudget, ChainStateStore, WipeDirective};
use crate::validation::{BlockValidator, RewindOutcome, VerifyReport, MIN_BLOCKS_TO_KEEP};
use crate::ChainStateHandle;

/// How far ahead of adjusted time the tip may be before the index is considered bad.
pub const MAX_FUTURE_BLOCK_TIME: u64 = 2 * 60 * 60;
pub const DEFAULT_CHECKBLOCKS: u32 = 6;
pub const DEFAULT_CHECKLEVEL: u32 = 3;
pub const MAX_CHECKLEVEL: u32 = 4;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoadOptions {
    pub reindex: bool,
    pub reindex_chainstate: bool,
    pub txindex: bool,
    pub prune: bool,
    pub resync_for_upgrade: bool,
    pub check_blocks: u32,
    pub check_level: u32,
    /// Network-adjusted unix time in seconds.
    pub adjusted_time: u64,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            reindex: false,
            reindex_chainstate: false,
            txindex: false,
            prune: false,
            resync_for_upgrade: false,
            check_blocks: DEFAULT_CHECKBLOCKS,
            check_level: DEFAULT_CHECKLEVEL,
            adjusted_time: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoadStep {
    LoadIndex,
    WipeAndRecreate,
    Upgrade,
    VerifyGenesisMatch,
    InitializeIfEmpty,
    CheckCompatibilityFlags,
    RewindIfForked,
    VerifyRecentBlocks,
    Loaded,
}

impl LoadStep {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadStep::LoadIndex => "load-index",
            LoadStep::WipeAndRecreate => "wipe-and-recreate",
            LoadStep::Upgrade => "upgrade",
            LoadStep::VerifyGenesisMatch => "verify-genesis",
            LoadStep::InitializeIfEmpty => "initialize",
            LoadStep::CheckCompatibilityFlags => "check-flags",
            LoadStep::RewindIfForked => "rewind",
            LoadStep::VerifyRecentBlocks => "verify",
            LoadStep::Loaded => "loaded",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LoadFailure {
    SchemaMismatch(String),
    IndexCorruption(String),
    Corrupted(String),
    Storage(String),
    WrongNetwork,
    Interrupted,
}

impl LoadFailure {
    /// Whether a reindex could plausibly fix this.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LoadFailure::SchemaMismatch(_)
                | LoadFailure::IndexCorruption(_)
                | LoadFailure::Corrupted(_)
                | LoadFailure::Storage(_)
        )
    }
}

impl fmt::Display for LoadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadFailure::SchemaMismatch(message)
            | LoadFailure::IndexCorruption(message)
            | LoadFailure::Corrupted(message)
            | LoadFailure::Storage(message) => write!(f, "{message}"),
            LoadFailure::WrongNetwork => {
                write!(f, "Incorrect or no genesis block found. Wrong datadir for network?")
            }
            LoadFailure::Interrupted => write!(f, "block index loading was interrupted"),
        }
    }
}

impl std::error::Error for LoadFailure {}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RecoveryOffer {
    /// Ask whether to retry once with a full reindex.
    Reindex { question: String },
    Fatal,
}

/// Only one reindex is ever offered per load attempt chain. Once `already_reset` is
/// set, every failure is final.
pub fn recovery_offer(failure: &LoadFailure, already_reset: bool) -> RecoveryOffer {
    if already_reset || !failure.is_recoverable() {
        return RecoveryOffer::Fatal;
    }
    RecoveryOffer::Reindex {
        question: format!("{failure}.\n\nDo you want to rebuild the block database now?"),
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub steps: Vec<LoadStep>,
    pub block_index_entries: usize,
    pub upgraded_entries: usize,
    /// The upgrade sub-protocol switched this load to a full reindex.
    pub forced_reindex: bool,
    pub initialized_genesis: bool,
    pub rewound: Option<u32>,
    pub verified: Option<VerifyReport>,
}

type Progress = Box<dyn Fn(&str) + Send + Sync>;

pub struct BlockIndexLoader {
    store: Arc<ChainStateStore>,
    validator: Arc<dyn BlockValidator>,
    genesis_hash: Hash256,
    interrupt: InterruptToken,
    progress: Option<Progress>,
}

impl BlockIndexLoader {
    pub fn new(
        store: Arc<ChainStateStore>,
        validator: Arc<dyn BlockValidator>,
        genesis_hash: Hash256,
        interrupt: InterruptToken,
    ) -> Self {
        Self {
            store,
            validator,
            genesis_hash,
            interrupt,
            progress: None,
        }
    }

    /// Receives the user-facing message for each step.
    pub fn with_progress(mut self, progress: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    fn report(&self, message: &str) {
        log_info!("{message}");
        if let Some(progress) = &self.progress {
            progress(message);
        }
    }

    fn check_interrupt(&self) -> Result<(), LoadFailure> {
        if self.interrupt.is_interrupted() {
            return Err(LoadFailure::Interrupted);
        }
        Ok(())
    }

    /// Runs one load attempt. `options.reindex` may be switched on by the upgrade
    /// sub-protocol; callers read it back to decide whether the import pipeline scans
    /// local block files.
    pub fn load(
        &self,
        budget: &CacheBudget,
        options: &mut LoadOptions,
    ) -> Result<LoadSummary, LoadFailure> {
        let mut summary = LoadSummary::default();
        let mut upgrade_pending = true;
        self.report("Loading block index...");

        let (tree, handle) = loop {
            self.check_interrupt()?;
            summary.steps.push(LoadStep::LoadIndex);
            self.store.teardown();
            let wipe = WipeDirective {
                block_index: options.reindex,
                chain_state: options.reindex || options.reindex_chainstate,
            };
            if wipe.any() {
                summary.steps.push(LoadStep::WipeAndRecreate);
            }
            self.store
                .construct(budget, wipe)
                .map_err(|err| storage_failure("Error opening block database", err))?;
            let tree = self.loaded_tree()?;
            let handle = self.loaded_handle()?;

            if options.reindex {
                let cleanup = self
                    .store
                    .prepare_for_reindex(options.prune)
                    .map_err(|err| storage_failure("Error opening block database", err))?;
                if let Some(cleanup) = cleanup {
                    log_info!(
                        "Removed {} undo files and {} block files past the first gap",
                        cleanup.removed_undo.len(),
                        cleanup.removed_blocks.len()
                    );
                }
            } else {
                summary.steps.push(LoadStep::Upgrade);
                let report = self.store.upgrade().map_err(|err| {
                    log_warn!("{err}");
                    LoadFailure::SchemaMismatch("Error upgrading chainstate database".to_string())
                })?;
                if report.main_coins + report.witness_coins > 0 {
                    log_info!(
                        "Upgraded {} main and {} witness coins",
                        report.main_coins,
                        report.witness_coins
                    );
                }
            }
            if options.reindex || options.reindex_chainstate {
                tree.write_flag(FLAG_TXINDEX, options.txindex)
                    .map_err(|err| storage_failure("Error opening block database", err))?;
            }

            let legacy = handle.stored_version() < handle.current_version()
                || tree.stored_version() < BLOCK_INDEX_VERSION;
            if upgrade_pending && legacy && options.resync_for_upgrade {
                upgrade_pending = false;
                self.force_reindex(options, &mut summary);
                continue;
            }

            summary.block_index_entries = tree
                .load_entries()
                .map_err(|err| storage_failure("Error loading block database", err))?
                .len();

            if upgrade_pending && legacy {
                upgrade_pending = false;
                self.report("Upgrading block index...");
                match self.store.upgrade_block_index() {
                    Ok(upgraded) => {
                        summary.upgraded_entries = upgraded;
                        self.report("Reloading block index...");
                        self.store
                            .flush()
                            .map_err(|err| storage_failure("Error loading block database", err))?;
                    }
                    Err(err) => {
                        log_warn!(
                            "Error upgrading block database ({err}), attempting to wipe index and resync instead"
                        );
                        self.force_reindex(options, &mut summary);
                    }
                }
                continue;
            }
            break (tree, handle);
        };

        self.check_interrupt()?;
        summary.steps.push(LoadStep::VerifyGenesisMatch);
        if summary.block_index_entries > 0 {
            let has_genesis = tree
                .entry(&self.genesis_hash)
                .map_err(|err| storage_failure("Error loading block database", err))?
                .is_some();
            if !has_genesis {
                return Err(LoadFailure::WrongNetwork);
            }
        }

        summary.steps.push(LoadStep::InitializeIfEmpty);
        summary.initialized_genesis = self.validator.init_block_index().map_err(|err| {
            log_warn!("{err}");
            LoadFailure::Storage("Error initializing block database".to_string())
        })?;

        summary.steps.push(LoadStep::CheckCompatibilityFlags);
        self.check_flags(&tree, options)?;

        self.check_interrupt()?;
        if !options.reindex && handle.main().best_block().is_some() {
            summary.steps.push(LoadStep::RewindIfForked);
            self.report("Rewinding blocks...");
            match self.validator.rewind_block_index() {
                Ok(RewindOutcome::NotNeeded) => {}
                Ok(RewindOutcome::Rewound { disconnected }) => summary.rewound = Some(disconnected),
                Err(err) => {
                    log_warn!("{err}");
                    return Err(LoadFailure::Corrupted(
                        "Unable to rewind the database to a pre-fork state. You will need to redownload the blockchain"
                            .to_string(),
                    ));
                }
            }
        }

        self.check_interrupt()?;
        summary.steps.push(LoadStep::VerifyRecentBlocks);
        self.report("Verifying blocks...");
        if let Some(tip) = self.validator.chain_tip() {
            if u64::from(tip.time) > options.adjusted_time + MAX_FUTURE_BLOCK_TIME {
                return Err(LoadFailure::Corrupted(
                    "The block database contains a block which appears to be from the future. \
                     This may be due to your computer's date and time being set incorrectly. \
                     Only rebuild the block database if you are sure that your computer's date and time are correct"
                        .to_string(),
                ));
            }
        }
        let pruned = tree.read_flag(FLAG_PRUNED).ok().flatten().unwrap_or(false);
        if pruned && options.check_blocks > MIN_BLOCKS_TO_KEEP {
            log_info!(
                "Prune: pruned datadir may not have more than {MIN_BLOCKS_TO_KEEP} blocks; only checking available blocks"
            );
        }
        let report = self
            .validator
            .verify_recent_blocks(
                options.check_blocks,
                options.check_level.min(MAX_CHECKLEVEL),
                &self.interrupt,
            )
            .map_err(|err| {
                log_warn!("Verification failed: {err}");
                LoadFailure::Corrupted("Corrupted block database detected".to_string())
            })?;
        if report.interrupted {
            return Err(LoadFailure::Interrupted);
        }
        summary.verified = Some(report);
        summary.steps.push(LoadStep::Loaded);

        if let Some(tip) = self.validator.chain_tip() {
            log_info!(
                "Block index loaded: {} entries, tip {} at height {}",
                summary.block_index_entries,
                hash_to_hex(&tip.hash),
                tip.height
            );
        }
        Ok(summary)
    }

    fn force_reindex(&self, options: &mut LoadOptions, summary: &mut LoadSummary) {
        self.report("Erasing block index...");
        options.reindex = true;
        summary.forced_reindex = true;
    }

    fn check_flags(&self, tree: &BlockTree, options: &LoadOptions) -> Result<(), LoadFailure> {
        let read = |name: &str| {
            tree.read_flag(name)
                .map(|value| value.unwrap_or(false))
                .map_err(|err| storage_failure("Error loading block database", err))
        };
        if read(FLAG_TXINDEX)? != options.txindex {
            return Err(LoadFailure::IndexCorruption(
                "You need to rebuild the database using -reindex-chainstate to change -txindex"
                    .to_string(),
            ));
        }
        if read(FLAG_PRUNED)? && !options.prune {
            return Err(LoadFailure::IndexCorruption(
                "You need to rebuild the database using -reindex to go back to unpruned mode. \
                 This will redownload the entire blockchain"
                    .to_string(),
            ));
        }
        Ok(())
    }

    fn loaded_tree(&self) -> Result<Arc<BlockTree>, LoadFailure> {
        self.store
            .block_tree()
            .ok_or_else(|| LoadFailure::Storage("block index store is not open".to_string()))
    }

    fn loaded_handle(&self) -> Result<Arc<ChainStateHandle>, LoadFailure> {
        self.store
            .handle()
            .ok_or_else(|| LoadFailure::Storage("chain state is not open".to_string()))
    }
}

fn storage_failure(context: &str, err: impl fmt::Display) -> LoadFailure {
    log_warn!("{context}: {err}");
    LoadFailure::Storage(context.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_first_recoverable_failure_is_offered() {
        let failure = LoadFailure::IndexCorruption("txindex changed".to_string());
        match recovery_offer(&failure, false) {
            RecoveryOffer::Reindex { question } => {
                assert!(question.starts_with("txindex changed."));
                assert!(question.contains("rebuild the block database"));
            }
            RecoveryOffer::Fatal => panic!("expected an offer"),
        }
        assert_eq!(recovery_offer(&failure, true), RecoveryOffer::Fatal);
    }

    #[test]
    fn wrong_network_and_interrupt_are_never_offered() {
        assert_eq!(recovery_offer(&LoadFailure::WrongNetwork, false), RecoveryOffer::Fatal);
        assert_eq!(recovery_offer(&LoadFailure::Interrupted, false), RecoveryOffer::Fatal);
        assert!(LoadFailure::Corrupted("x".to_string()).is_recoverable());
    }

    #[test]
    fn default_options_verify_recent_blocks() {
        let options = LoadOptions::default();
        assert_eq!(options.check_blocks, DEFAULT_CHECKBLOCKS);
        assert_eq!(options.check_level, DEFAULT_CHECKLEVEL);
        assert!(!options.reindex);
    }
}
