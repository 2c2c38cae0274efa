//! Boot and shutdown sequencing for the node.
//!
//! [`Orchestrator::startup`] walks the fixed startup order and returns once the node is
//! serving (or has decided not to start). [`Orchestrator::shutdown`] unwinds whatever
//! startup managed to bring up, in the reverse-dependency order below, and is safe to
//! call any number of times from any number of tasks.

use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use dualchain_chainstate::catcher::FatalReadHandler;
use dualchain_chainstate::interrupt::{interrupt_channel, InterruptSource};
use dualchain_chainstate::loader::{
    recovery_offer, BlockIndexLoader, LoadFailure, LoadOptions, LoadSummary, RecoveryOffer,
};
use dualchain_chainstate::params::{chain_params, ChainParams};
use dualchain_chainstate::store::TeardownReport;
use dualchain_chainstate::validation::{BlockValidator, ChainTip, ChainValidator, ValidatorOptions};
use dualchain_chainstate::{ChainStateStore, StoreLayout};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::budget::{BudgetError, BudgetRequest, ResolvedResources, ResourceBudgeter};
use crate::collaborators::{BindFlags, Collaborators, NetworkStartOptions};
use crate::config::{Config, PruneMode};
use crate::datadir::{
    apply_shutdown_directive, lock_data_dir, remove_pid_file, write_pid_file, DataDirLock,
    DEBUG_LOG_FILE_NAME, FEE_ESTIMATES_FILE_NAME, MEMPOOL_FILE_NAME,
};
use crate::fee_estimator::FeeEstimator;
use crate::host::HostCapacity;
use crate::import::{ImportHandle, ImportJob, ImportPipeline};
use crate::logging;
use crate::mempool::{persist_mempool_loop, save_mempool_file, Mempool};
use crate::phase::{LifecyclePhase, PhaseTracker, ShutdownRequest};
use crate::rpc::{bind_rpc, serve_rpc, RpcState, WarmupStatus};
use crate::sanity::CryptoContext;

/// Pause between shutdown steps so observers can react to the previous one.
pub const SHUTDOWN_SETTLE_DELAY: Duration = Duration::from_millis(20);
pub const MEMPOOL_PERSIST_INTERVAL: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_MIN_RELAY_FEE_PER_KB: i64 = 1000;

const NO_LISTENER_MESSAGE: &str = "Failed to listen on any port. Use --no-listen if you want this.";

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InitError {
    Config(String),
    ResourceExhausted(String),
    StorageCorruption(String),
    SchemaMismatch(String),
    IndexCorruption(String),
    NetworkBindFailure(String),
    ImportFailure(String),
    Sanity(String),
    Storage(String),
    Wallet(String),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::Config(message)
            | InitError::ResourceExhausted(message)
            | InitError::StorageCorruption(message)
            | InitError::SchemaMismatch(message)
            | InitError::IndexCorruption(message)
            | InitError::NetworkBindFailure(message)
            | InitError::ImportFailure(message)
            | InitError::Sanity(message)
            | InitError::Storage(message)
            | InitError::Wallet(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for InitError {}

impl From<BudgetError> for InitError {
    fn from(err: BudgetError) -> Self {
        InitError::ResourceExhausted(err.to_string())
    }
}

impl From<LoadFailure> for InitError {
    fn from(failure: LoadFailure) -> Self {
        let message = failure.to_string();
        match failure {
            LoadFailure::SchemaMismatch(_) => InitError::SchemaMismatch(message),
            LoadFailure::IndexCorruption(_) => InitError::IndexCorruption(message),
            LoadFailure::Corrupted(_) => InitError::StorageCorruption(message),
            LoadFailure::Storage(_) | LoadFailure::Interrupted => InitError::Storage(message),
            LoadFailure::WrongNetwork => InitError::Config(message),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StartupOutcome {
    Running,
    /// Startup stopped early on request (signal, RPC `stop`, declined recovery). Not an
    /// error.
    DidNotStart,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShutdownStep {
    Interrupt,
    JoinWorkers,
    WalletFlush,
    StopNetwork,
    PersistSnapshots,
    StoreTeardown,
    WalletFinalFlush,
    ReleaseSubscribers,
    StopCrypto,
    ApplyDirective,
    Done,
}

#[derive(Clone, Debug, Default)]
pub struct ShutdownReport {
    pub steps: Vec<ShutdownStep>,
    pub teardown: Option<TeardownReport>,
    pub erased: Vec<PathBuf>,
}

/// Everything startup brought up that shutdown has to take down again.
#[derive(Default)]
struct Runtime {
    data_dir: Option<PathBuf>,
    lock: Option<DataDirLock>,
    pid_file: Option<PathBuf>,
    resources: Option<ResolvedResources>,
    store: Option<Arc<ChainStateStore>>,
    validator: Option<Arc<ChainValidator>>,
    fee_estimator: Option<Arc<Mutex<FeeEstimator>>>,
    mempool: Option<Arc<Mutex<Mempool>>>,
    rpc_state: Option<Arc<RpcState>>,
    rpc_addr: Option<SocketAddr>,
    rpc_task: Option<JoinHandle<()>>,
    import: Option<ImportHandle>,
    persist: Option<thread::JoinHandle<()>>,
    bound: Vec<SocketAddr>,
    wallet_loaded: bool,
    network_started: bool,
    dump_mempool: bool,
}

pub struct Orchestrator {
    config: Config,
    params: ChainParams,
    host: HostCapacity,
    collaborators: Collaborators,
    phase: PhaseTracker,
    shutdown_request: ShutdownRequest,
    interrupt: InterruptSource,
    crypto: CryptoContext,
    warmup: Arc<WarmupStatus>,
    fatal_handler: Option<FatalReadHandler>,
    install_signal_handlers: bool,
    shutdown_started: AtomicBool,
    import_failure: Mutex<Option<String>>,
    runtime: Mutex<Runtime>,
}

impl Orchestrator {
    pub fn new(config: Config, host: HostCapacity, collaborators: Collaborators) -> Self {
        let (interrupt, _token) = interrupt_channel();
        Self {
            params: chain_params(config.network),
            config,
            host,
            collaborators,
            phase: PhaseTracker::new(),
            shutdown_request: ShutdownRequest::new(),
            interrupt,
            crypto: CryptoContext::new(),
            warmup: Arc::new(WarmupStatus::new()),
            fatal_handler: None,
            install_signal_handlers: false,
            shutdown_started: AtomicBool::new(false),
            import_failure: Mutex::new(None),
            runtime: Mutex::new(Runtime::default()),
        }
    }

    /// Installs SIGINT/SIGTERM/SIGHUP handling at the start of `startup`.
    pub fn with_signal_handlers(mut self) -> Self {
        self.install_signal_handlers = true;
        self
    }

    pub fn with_fatal_handler(mut self, handler: FatalReadHandler) -> Self {
        self.fatal_handler = Some(handler);
        self
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase.current()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<LifecyclePhase> {
        self.phase.subscribe()
    }

    pub fn shutdown_request(&self) -> ShutdownRequest {
        self.shutdown_request.clone()
    }

    pub async fn wait_for_shutdown_request(&self) {
        self.shutdown_request.wait().await;
    }

    pub fn import_failure(&self) -> Option<String> {
        self.import_failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn resources(&self) -> Option<ResolvedResources> {
        self.runtime().resources.clone()
    }

    pub fn rpc_addr(&self) -> Option<SocketAddr> {
        self.runtime().rpc_addr
    }

    pub fn bound_addrs(&self) -> Vec<SocketAddr> {
        self.runtime().bound.clone()
    }

    pub fn store(&self) -> Option<Arc<ChainStateStore>> {
        self.runtime().store.clone()
    }

    pub fn chain_tip(&self) -> Option<ChainTip> {
        let validator = self.runtime().validator.clone()?;
        validator.chain_tip()
    }

    pub async fn startup(&self) -> Result<StartupOutcome, InitError> {
        // Allocation failure aborts the process; there is nothing to install for it.
        if self.install_signal_handlers {
            crate::spawn_signal_handlers(self.shutdown_request.clone());
        }

        self.init_message("Running self-tests...");
        self.crypto.start().map_err(InitError::Sanity)?;
        self.advance(LifecyclePhase::SanityChecked)?;

        let (data_dir, resources) = self.resolve_parameters()?;
        self.advance(LifecyclePhase::ParametersResolved)?;

        self.init_logging(&data_dir);
        resources.log_summary();
        if self.config.server {
            self.start_rpc().await?;
        }

        let (store, validator, summary, reindex) =
            match self.load_chain_state(&data_dir, &resources).await? {
                Some(loaded) => loaded,
                None => return Ok(StartupOutcome::DidNotStart),
            };
        if self.shutdown_request.is_requested() {
            return Ok(StartupOutcome::DidNotStart);
        }
        log_info!(
            "Loaded block index ({} entries{})",
            summary.block_index_entries,
            if reindex { ", reindex pending" } else { "" }
        );
        self.advance(LifecyclePhase::StoreLoaded)?;

        self.init_message("Loading fee estimates...");
        let fee_path = data_dir.join(FEE_ESTIMATES_FILE_NAME);
        let estimator = FeeEstimator::load(&fee_path, DEFAULT_MIN_RELAY_FEE_PER_KB)
            .unwrap_or_else(|err| {
                log_warn!("Failed to read fee estimates from {}: {err}", fee_path.display());
                FeeEstimator::new(DEFAULT_MIN_RELAY_FEE_PER_KB)
            });
        let mempool = Arc::new(Mutex::new(Mempool::new(resources.budget.mempool_max_bytes)));
        {
            let mut runtime = self.runtime();
            runtime.fee_estimator = Some(Arc::new(Mutex::new(estimator)));
            runtime.mempool = Some(Arc::clone(&mempool));
        }

        self.load_wallet()?;
        self.advance(LifecyclePhase::WalletLoaded)?;

        self.start_network(&resources)?;
        self.advance(LifecyclePhase::ServicesStarted)?;

        let genesis = self.start_import(&data_dir, store, validator, mempool, reindex)?;
        self.advance(LifecyclePhase::Importing)?;

        self.init_message("Waiting for genesis block...");
        if !self.wait_for_genesis(genesis).await? {
            return Ok(StartupOutcome::DidNotStart);
        }

        self.warmup.finish();
        self.advance(LifecyclePhase::Running)?;
        if self.runtime().wallet_loaded {
            self.collaborators.wallet.post_init_process();
        }
        self.init_message("Done loading");
        if let Some(tip) = self.chain_tip() {
            log_info!("Node is running at height {}", tip.height);
        }
        Ok(StartupOutcome::Running)
    }

    /// Returns `None` when another call already ran (or is running) the sequence.
    pub async fn shutdown(&self) -> Option<ShutdownReport> {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return None;
        }
        log_info!("Shutdown: In progress...");
        self.phase.advance_to_at_least(LifecyclePhase::Interrupting);
        let mut report = ShutdownReport::default();

        self.shutdown_request.request();
        self.interrupt.interrupt();
        self.collaborators.network.interrupt();
        report.steps.push(ShutdownStep::Interrupt);
        settle().await;

        self.join_workers().await;
        report.steps.push(ShutdownStep::JoinWorkers);
        self.phase.advance_to_at_least(LifecyclePhase::ShuttingDown);
        settle().await;

        let wallet_loaded = self.runtime().wallet_loaded;
        if wallet_loaded {
            self.collaborators.wallet.flush(false);
        }
        report.steps.push(ShutdownStep::WalletFlush);

        self.collaborators.network.stop();
        report.steps.push(ShutdownStep::StopNetwork);
        settle().await;

        self.persist_snapshots();
        report.steps.push(ShutdownStep::PersistSnapshots);

        let store = self.runtime().store.clone();
        if let Some(store) = store {
            match tokio::task::spawn_blocking(move || store.teardown()).await {
                Ok(teardown) => {
                    if let Some(err) = &teardown.flush_error {
                        log_error!("Failed to flush chain state: {err}");
                    }
                    report.teardown = Some(teardown);
                }
                Err(err) => log_error!("chain state teardown panicked: {err}"),
            }
        }
        report.steps.push(ShutdownStep::StoreTeardown);

        if wallet_loaded {
            self.collaborators.wallet.flush(true);
        }
        report.steps.push(ShutdownStep::WalletFinalFlush);

        {
            let mut runtime = self.runtime();
            runtime.rpc_state = None;
            runtime.validator = None;
            runtime.store = None;
            if let Some(pid_file) = runtime.pid_file.take() {
                remove_pid_file(&pid_file);
            }
        }
        self.phase.release_subscribers();
        report.steps.push(ShutdownStep::ReleaseSubscribers);

        self.crypto.stop();
        report.steps.push(ShutdownStep::StopCrypto);

        let (data_dir, locked) = {
            let runtime = self.runtime();
            (runtime.data_dir.clone(), runtime.lock.is_some())
        };
        if let (Some(data_dir), true) = (data_dir, locked) {
            report.erased =
                apply_shutdown_directive(&data_dir, self.config.erase_on_shutdown.directive());
        }
        report.steps.push(ShutdownStep::ApplyDirective);

        self.runtime().lock = None;
        self.phase.advance_to_at_least(LifecyclePhase::Stopped);
        report.steps.push(ShutdownStep::Done);
        log_info!("Shutdown: done");
        Some(report)
    }

    fn runtime(&self) -> MutexGuard<'_, Runtime> {
        self.runtime
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn advance(&self, next: LifecyclePhase) -> Result<(), InitError> {
        self.phase
            .advance(next)
            .map_err(|err| InitError::Config(err.to_string()))
    }

    fn init_message(&self, text: &str) {
        self.collaborators.notifier.on_init_message(text);
        self.warmup.set(text);
    }

    fn resolve_parameters(&self) -> Result<(PathBuf, ResolvedResources), InitError> {
        self.config.validate().map_err(InitError::Config)?;
        let data_dir = self.config.network_data_dir();
        fs::create_dir_all(&data_dir).map_err(|err| {
            InitError::Config(format!(
                "Specified data directory \"{}\" does not exist and cannot be created: {err}",
                data_dir.display()
            ))
        })?;
        let lock = lock_data_dir(&data_dir).map_err(InitError::Config)?;
        {
            let mut runtime = self.runtime();
            runtime.data_dir = Some(data_dir.clone());
            runtime.lock = Some(lock);
        }
        let pid_file = write_pid_file(&data_dir).map_err(InitError::Config)?;
        self.runtime().pid_file = Some(pid_file);

        let request = BudgetRequest {
            db_cache_mib: self.config.db_cache_mib,
            txindex: self.config.txindex,
            max_mempool_mb: self.config.max_mempool_mb,
            max_connections: self.config.max_connections,
            rpc_threads: self.config.rpc_threads,
            reverse_headers: self.config.reverse_headers,
            bind_count: self.config.bind_count(),
        };
        let resources = ResourceBudgeter::new(self.host).resolve(&request)?;
        self.runtime().resources = Some(resources.clone());
        Ok((data_dir, resources))
    }

    /// `printtoconsole` keeps everything on stderr. Otherwise lines go to `debug.log` only.
    fn init_logging(&self, data_dir: &std::path::Path) {
        let mut print_to_console = self.config.print_to_console;
        if !print_to_console {
            let path = data_dir.join(DEBUG_LOG_FILE_NAME);
            if self.config.shrink_debug_file {
                if let Err(err) = logging::shrink_file(&path) {
                    log_warn!("failed to shrink {}: {err}", path.display());
                }
            }
            if let Err(err) = logging::open_file(&path) {
                log_warn!("failed to open {}: {err}", path.display());
                print_to_console = true;
            }
        }
        logging::init(logging::LogConfig {
            level: self.config.log_level,
            format: self.config.log_format,
            timestamps: self.config.log_timestamps,
            print_to_console,
        });
        log_info!(
            "dualchaind version {} ({} network)",
            env!("CARGO_PKG_VERSION"),
            self.params.network.as_str()
        );
        log_info!("Using data directory {}", data_dir.display());
        for key in &self.config.unsupported_conf_keys {
            log_warn!("Ignoring unsupported config key '{key}'");
        }
    }

    async fn start_rpc(&self) -> Result<(), InitError> {
        let listener = bind_rpc(self.config.rpc_addr)
            .await
            .map_err(InitError::NetworkBindFailure)?;
        let local = listener
            .local_addr()
            .map_err(|err| InitError::NetworkBindFailure(err.to_string()))?;
        let workers = self
            .runtime()
            .resources
            .as_ref()
            .map(|resources| resources.rpc_threads)
            .unwrap_or(1);
        let state = Arc::new(RpcState::new(
            Arc::clone(&self.warmup),
            self.shutdown_request.clone(),
            self.params.network,
        ));
        let task = tokio::spawn(serve_rpc(
            listener,
            Arc::clone(&state),
            workers,
            self.interrupt.token(),
        ));
        let mut runtime = self.runtime();
        runtime.rpc_state = Some(state);
        runtime.rpc_addr = Some(local);
        runtime.rpc_task = Some(task);
        Ok(())
    }

    /// Runs the loader, offering one reindex on a recoverable failure. `None` means the
    /// node should not start.
    async fn load_chain_state(
        &self,
        data_dir: &std::path::Path,
        resources: &ResolvedResources,
    ) -> Result<Option<(Arc<ChainStateStore>, Arc<ChainValidator>, LoadSummary, bool)>, InitError>
    {
        self.advance(LifecyclePhase::StoreLoading)?;
        let mut store = ChainStateStore::new(
            StoreLayout::new(data_dir),
            Arc::clone(&self.collaborators.opener),
            self.params.message_start,
        );
        if let Some(handler) = self.fatal_handler {
            store = store.with_fatal_handler(handler);
        }
        let store = Arc::new(store);
        let prune_target_bytes = match self.config.prune_mode() {
            PruneMode::TargetMib(mib) => Some(crate::mib_to_bytes(mib)),
            PruneMode::Disabled | PruneMode::Manual => None,
        };
        let validator = Arc::new(ChainValidator::new(
            Arc::clone(&store),
            self.params.clone(),
            ValidatorOptions {
                txindex: self.config.txindex,
                prune_target_bytes,
            },
        ));
        {
            let mut runtime = self.runtime();
            runtime.store = Some(Arc::clone(&store));
            runtime.validator = Some(Arc::clone(&validator));
            if let Some(state) = &runtime.rpc_state {
                state.attach_validator(validator.clone());
            }
        }

        let mut options = LoadOptions {
            reindex: self.config.reindex,
            reindex_chainstate: self.config.reindex_chainstate,
            txindex: self.config.txindex,
            prune: self.config.is_pruned(),
            resync_for_upgrade: self.config.resync_for_upgrade,
            check_blocks: self.config.check_blocks,
            check_level: self.config.check_level,
            adjusted_time: crate::unix_now_secs(),
        };
        // A --reindex launch has already spent its one rebuild.
        let mut already_reset = options.reindex;
        let budget = resources.budget;

        let summary = loop {
            let notifier = Arc::clone(&self.collaborators.notifier);
            let warmup = Arc::clone(&self.warmup);
            let loader = BlockIndexLoader::new(
                Arc::clone(&store),
                validator.clone(),
                self.params.genesis_hash,
                self.shutdown_request.token(),
            )
            .with_progress(move |text| {
                notifier.on_init_message(text);
                warmup.set(text);
            });
            let attempt = options.clone();
            let (result, attempt) = tokio::task::spawn_blocking(move || {
                let mut attempt = attempt;
                let result = loader.load(&budget, &mut attempt);
                (result, attempt)
            })
            .await
            .map_err(|err| InitError::Storage(format!("block index loader panicked: {err}")))?;
            options = attempt;

            let failure = match result {
                Ok(summary) => break summary,
                Err(LoadFailure::Interrupted) => {
                    log_info!("Shutdown requested while loading the block index");
                    return Ok(None);
                }
                Err(failure) => failure,
            };
            log_error!("{failure}");
            match recovery_offer(&failure, already_reset) {
                RecoveryOffer::Fatal => return Err(failure.into()),
                RecoveryOffer::Reindex { question } => {
                    if self.shutdown_request.is_requested() {
                        return Ok(None);
                    }
                    if !self.collaborators.notifier.on_recovery_question(&question) {
                        log_info!("Aborted block database rebuild. Exiting.");
                        return Ok(None);
                    }
                    already_reset = true;
                    options.reindex = true;
                    self.advance(LifecyclePhase::StoreLoading)?;
                }
            }
        };

        let reindexing = store
            .block_tree()
            .and_then(|tree| tree.is_reindexing().ok())
            .unwrap_or(false);
        Ok(Some((store, validator, summary, options.reindex || reindexing)))
    }

    fn load_wallet(&self) -> Result<(), InitError> {
        if self.config.disable_wallet {
            log_info!("Wallet disabled!");
            return Ok(());
        }
        self.init_message("Verifying wallet...");
        self.collaborators.wallet.verify().map_err(InitError::Wallet)?;
        self.init_message("Loading wallet...");
        self.collaborators
            .wallet
            .init_load_wallet()
            .map_err(InitError::Wallet)?;
        self.runtime().wallet_loaded = true;
        Ok(())
    }

    fn start_network(&self, resources: &ResolvedResources) -> Result<(), InitError> {
        self.init_message("Starting network threads...");
        if self.config.listen {
            let explicit = self.config.bind_count() > 0;
            let mut bound = Vec::new();
            for (addr, whitelisted) in self.config.listen_addrs() {
                let flags = BindFlags {
                    whitelisted,
                    report_error: explicit,
                };
                if let Ok(local) = self.collaborators.network.bind(addr, flags) {
                    bound.push(local);
                }
            }
            if bound.is_empty() {
                return Err(InitError::NetworkBindFailure(NO_LISTENER_MESSAGE.to_string()));
            }
            self.runtime().bound = bound;
        }

        let pruned = self.config.is_pruned();
        if pruned {
            log_info!("Pruning enabled; not advertising full node service");
        }
        self.collaborators
            .network
            .start(NetworkStartOptions {
                max_connections: resources.max_connections,
                advertise_full_node: !pruned,
                reverse_headers: resources.reverse_headers,
            })
            .map_err(InitError::NetworkBindFailure)?;
        self.runtime().network_started = true;
        Ok(())
    }

    fn start_import(
        &self,
        data_dir: &std::path::Path,
        store: Arc<ChainStateStore>,
        validator: Arc<ChainValidator>,
        mempool: Arc<Mutex<Mempool>>,
        reindex: bool,
    ) -> Result<watch::Receiver<bool>, InitError> {
        let (genesis_tx, genesis_rx) = watch::channel(false);
        let job = ImportJob::plan(reindex, data_dir, &self.config.load_blocks);
        if !job.is_empty() {
            self.init_message("Importing blocks...");
        }
        let validator: Arc<dyn BlockValidator> = validator;
        let mut pipeline = ImportPipeline::new(
            store,
            validator,
            self.interrupt.token(),
            self.shutdown_request.clone(),
            genesis_tx,
        )
        .with_stop_after_import(self.config.stop_after_import);
        let mempool_path = data_dir.join(MEMPOOL_FILE_NAME);
        if self.config.persist_mempool {
            pipeline = pipeline.with_mempool_reload(mempool_path.clone(), Arc::clone(&mempool));
        }
        let import = pipeline.spawn(job).map_err(InitError::Storage)?;
        self.runtime().import = Some(import);

        if self.config.persist_mempool {
            let interrupt = self.interrupt.token();
            let persist = thread::Builder::new()
                .name("dualchain-mempool-persist".to_string())
                .spawn(move || {
                    persist_mempool_loop(mempool, mempool_path, MEMPOOL_PERSIST_INTERVAL, interrupt)
                })
                .map_err(|err| InitError::Storage(format!("failed to spawn persist thread: {err}")))?;
            self.runtime().persist = Some(persist);
        }
        Ok(genesis_rx)
    }

    /// `Ok(false)` if shutdown was requested first.
    async fn wait_for_genesis(&self, mut genesis: watch::Receiver<bool>) -> Result<bool, InitError> {
        loop {
            if *genesis.borrow_and_update() {
                return Ok(true);
            }
            if self.shutdown_request.is_requested() {
                return Ok(false);
            }
            tokio::select! {
                changed = genesis.changed() => {
                    if changed.is_err() && !*genesis.borrow() {
                        // The import worker exited without a genesis block. If it failed,
                        // it has already asked for shutdown.
                        if self.shutdown_request.is_requested() {
                            return Ok(false);
                        }
                        return Err(InitError::ImportFailure(
                            "block import finished without connecting a genesis block".to_string(),
                        ));
                    }
                }
                _ = self.shutdown_request.wait() => return Ok(false),
            }
        }
    }

    async fn join_workers(&self) {
        let (rpc_task, import, persist) = {
            let mut runtime = self.runtime();
            (
                runtime.rpc_task.take(),
                runtime.import.take(),
                runtime.persist.take(),
            )
        };
        if let Some(task) = rpc_task {
            if let Err(err) = task.await {
                log_warn!("RPC server task failed: {err}");
            }
        }
        let joined = tokio::task::spawn_blocking(move || {
            let import = import.and_then(ImportHandle::join);
            if let Some(persist) = persist {
                if persist.join().is_err() {
                    log_warn!("mempool persist thread panicked");
                }
            }
            import
        })
        .await;
        match joined {
            Ok(Some(Ok(report))) => self.runtime().dump_mempool = report.dump_mempool,
            Ok(Some(Err(err))) => {
                *self
                    .import_failure
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(err.to_string());
            }
            Ok(None) => {}
            Err(err) => log_warn!("worker join failed: {err}"),
        }
    }

    fn persist_snapshots(&self) {
        let (data_dir, estimator, mempool, dump_mempool) = {
            let runtime = self.runtime();
            (
                runtime.data_dir.clone(),
                runtime.fee_estimator.clone(),
                runtime.mempool.clone(),
                runtime.dump_mempool,
            )
        };
        let Some(data_dir) = data_dir else {
            return;
        };
        if let Some(estimator) = estimator {
            let path = data_dir.join(FEE_ESTIMATES_FILE_NAME);
            let estimator = estimator
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match estimator.save(&path) {
                Ok(bytes) => log_debug!("Wrote fee estimates ({bytes} bytes)"),
                Err(err) => log_warn!("Failed to write fee estimates to {}: {err}", path.display()),
            }
        }
        if let (Some(mempool), true) = (mempool, dump_mempool && self.config.persist_mempool) {
            let path = data_dir.join(MEMPOOL_FILE_NAME);
            let mempool = mempool.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match save_mempool_file(&path, &mempool) {
                Ok(bytes) => log_info!("Dumped mempool ({} txs, {bytes} bytes)", mempool.len()),
                Err(err) => log_warn!("Failed to dump mempool to {}: {err}", path.display()),
            }
        }
    }
}

async fn settle() {
    tokio::time::sleep(SHUTDOWN_SETTLE_DELAY).await;
}
