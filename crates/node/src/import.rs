//! Background block import: reindex scan, legacy bootstrap file, `--loadblock` files,
//! then best-chain activation.

use std::fmt;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::Receiver;
use dualchain_chainstate::interrupt::InterruptToken;
use dualchain_chainstate::validation::{ActivationReport, BlockValidator, ImportStats};
use dualchain_chainstate::ChainStateStore;
use tokio::sync::watch;

use crate::mempool::{reload_mempool, Mempool, MempoolLoadStats};
use crate::phase::ShutdownRequest;

pub const BOOTSTRAP_FILE_NAME: &str = "bootstrap.dat";
pub const BOOTSTRAP_OLD_FILE_NAME: &str = "bootstrap.dat.old";
const IMPORT_THREAD_NAME: &str = "dualchain-import";

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ImportSource {
    /// Every local `blkNNNNN.dat` from 0 up to the first gap.
    ReindexScan,
    Bootstrap(PathBuf),
    File(PathBuf),
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ImportJob {
    pub sources: Vec<ImportSource>,
}

impl ImportJob {
    pub fn plan(reindex: bool, data_dir: &Path, load_blocks: &[PathBuf]) -> Self {
        let mut sources = Vec::new();
        if reindex {
            sources.push(ImportSource::ReindexScan);
        }
        let bootstrap = data_dir.join(BOOTSTRAP_FILE_NAME);
        if bootstrap.is_file() {
            sources.push(ImportSource::Bootstrap(bootstrap));
        }
        sources.extend(load_blocks.iter().cloned().map(ImportSource::File));
        Self { sources }
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[derive(Debug)]
pub enum ImportError {
    Storage(String),
    Activation(String),
}

impl fmt::Display for ImportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportError::Storage(message) => write!(f, "{message}"),
            ImportError::Activation(message) => {
                write!(f, "Failed to connect best block ({message})")
            }
        }
    }
}

impl std::error::Error for ImportError {}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImportedFile {
    pub label: String,
    pub stats: ImportStats,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ImportReport {
    pub files: Vec<ImportedFile>,
    pub blocks_accepted: usize,
    pub activation: Option<ActivationReport>,
    pub interrupted: bool,
    pub mempool: Option<MempoolLoadStats>,
    /// Whether shutdown should write `mempool.dat`.
    pub dump_mempool: bool,
}

impl ImportReport {
    fn record(&mut self, label: String, stats: ImportStats) {
        self.blocks_accepted += stats.accepted;
        if stats.interrupted {
            self.interrupted = true;
        }
        self.files.push(ImportedFile { label, stats });
    }
}

struct MempoolReload {
    path: PathBuf,
    mempool: Arc<Mutex<Mempool>>,
}

pub struct ImportPipeline {
    store: Arc<ChainStateStore>,
    validator: Arc<dyn BlockValidator>,
    interrupt: InterruptToken,
    shutdown: ShutdownRequest,
    genesis: watch::Sender<bool>,
    stop_after_import: bool,
    mempool: Option<MempoolReload>,
}

impl ImportPipeline {
    pub fn new(
        store: Arc<ChainStateStore>,
        validator: Arc<dyn BlockValidator>,
        interrupt: InterruptToken,
        shutdown: ShutdownRequest,
        genesis: watch::Sender<bool>,
    ) -> Self {
        Self {
            store,
            validator,
            interrupt,
            shutdown,
            genesis,
            stop_after_import: false,
            mempool: None,
        }
    }

    pub fn with_stop_after_import(mut self, stop_after_import: bool) -> Self {
        self.stop_after_import = stop_after_import;
        self
    }

    /// Reload `path` into `mempool` once the chain is activated.
    pub fn with_mempool_reload(mut self, path: PathBuf, mempool: Arc<Mutex<Mempool>>) -> Self {
        self.mempool = Some(MempoolReload { path, mempool });
        self
    }

    pub fn run(&self, job: &ImportJob) -> Result<ImportReport, ImportError> {
        let mut report = ImportReport::default();
        for source in &job.sources {
            if self.interrupt.is_interrupted() {
                report.interrupted = true;
                break;
            }
            match source {
                ImportSource::ReindexScan => self.reindex_scan(&mut report)?,
                ImportSource::Bootstrap(path) => {
                    if self.import_file(path, &mut report) && !report.interrupted {
                        let old = path.with_file_name(BOOTSTRAP_OLD_FILE_NAME);
                        match fs::rename(path, &old) {
                            Ok(()) => log_info!("Renamed {} to {}", path.display(), old.display()),
                            Err(err) => log_warn!("failed to rename {}: {err}", path.display()),
                        }
                    }
                }
                ImportSource::File(path) => {
                    self.import_file(path, &mut report);
                }
            }
            self.signal_genesis_if_available();
        }

        if report.interrupted || self.interrupt.is_interrupted() {
            report.interrupted = true;
            log_info!("Shutdown requested. Exiting block import.");
            return Ok(report);
        }

        let activation = self
            .validator
            .activate_best_chain(&self.interrupt)
            .map_err(|err| ImportError::Activation(err.to_string()))?;
        report.interrupted = activation.interrupted;
        report.activation = Some(activation);
        self.signal_genesis_if_available();

        if self.stop_after_import && !report.interrupted {
            log_info!("Stopping after block import");
            self.shutdown.request();
            return Ok(report);
        }

        if let Some(reload) = &self.mempool {
            match reload_mempool(&reload.path, &reload.mempool) {
                Ok(stats) => report.mempool = Some(stats),
                Err(err) => log_warn!("failed to load {}: {err}", reload.path.display()),
            }
        }
        report.dump_mempool = self.mempool.is_some() && !self.shutdown.is_requested();
        Ok(report)
    }

    /// Runs the job on its own thread. An error is logged and turns into a shutdown
    /// request, since nobody is waiting on the result by then.
    pub fn spawn(self, job: ImportJob) -> Result<ImportHandle, String> {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let thread = thread::Builder::new()
            .name(IMPORT_THREAD_NAME.to_string())
            .spawn(move || {
                let result = self.run(&job);
                if let Err(err) = &result {
                    log_error!("Block import failed: {err}");
                    self.shutdown.request();
                }
                let _ = done_tx.send(result);
            })
            .map_err(|err| format!("failed to spawn import thread: {err}"))?;
        Ok(ImportHandle {
            thread,
            done: done_rx,
        })
    }

    fn reindex_scan(&self, report: &mut ImportReport) -> Result<(), ImportError> {
        let mut file_id = 0u32;
        loop {
            if self.interrupt.is_interrupted() {
                report.interrupted = true;
                return Ok(());
            }
            let file = match self.store.open_block_file(file_id) {
                Ok(Some(file)) => file,
                Ok(None) => break,
                Err(err) => {
                    return Err(ImportError::Storage(format!(
                        "failed to open block file {file_id}: {err}"
                    )))
                }
            };
            log_info!("Reindexing block file blk{file_id:05}.dat...");
            let mut reader = BufReader::new(file);
            match self
                .validator
                .load_external_block_file(&mut reader, Some(file_id), &self.interrupt)
            {
                Ok(stats) => report.record(format!("blk{file_id:05}.dat"), stats),
                Err(err) => log_warn!("error while reindexing blk{file_id:05}.dat: {err}"),
            }
            if report.interrupted {
                return Ok(());
            }
            file_id += 1;
        }

        let tree = self
            .store
            .block_tree()
            .ok_or_else(|| ImportError::Storage("block index is not loaded".to_string()))?;
        tree.write_reindexing(false)
            .map_err(|err| ImportError::Storage(format!("failed to clear reindex flag: {err}")))?;
        log_info!("Reindexing finished");
        self.validator
            .init_block_index()
            .map_err(|err| ImportError::Storage(format!("failed to initialize block index: {err}")))?;
        Ok(())
    }

    /// Returns whether the file was read. Missing or unreadable files are skipped.
    fn import_file(&self, path: &Path, report: &mut ImportReport) -> bool {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) => {
                log_warn!("Warning: Could not open blocks file {}: {err}", path.display());
                return false;
            }
        };
        log_info!("Importing blocks file {}...", path.display());
        let mut reader = BufReader::new(file);
        match self
            .validator
            .load_external_block_file(&mut reader, None, &self.interrupt)
        {
            Ok(stats) => {
                report.record(path.display().to_string(), stats);
                true
            }
            Err(err) => {
                log_warn!("error while importing {}: {err}", path.display());
                false
            }
        }
    }

    fn signal_genesis_if_available(&self) {
        let available = self
            .store
            .handle()
            .and_then(|handle| handle.main().best_block())
            .is_some();
        if available && !*self.genesis.borrow() {
            log_debug!("Genesis block is available");
            self.genesis.send_replace(true);
        }
    }
}

pub struct ImportHandle {
    thread: thread::JoinHandle<()>,
    done: Receiver<Result<ImportReport, ImportError>>,
}

impl ImportHandle {
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Blocks until the worker exits. `None` if it panicked.
    pub fn join(self) -> Option<Result<ImportReport, ImportError>> {
        if self.thread.join().is_err() {
            log_error!("block import thread panicked");
            return None;
        }
        self.done.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dualchain_chainstate::interrupt::interrupt_channel;
    use dualchain_chainstate::params::{chain_params, Network};
    use dualchain_chainstate::store::{CacheBudget, MemoryOpener, StoreLayout, WipeDirective};
    use dualchain_chainstate::validation::{
        ChainTip, ChainValidator, RewindOutcome, ValidationError, ValidatorOptions, VerifyReport,
    };
    use std::io::Read;

    #[derive(Default)]
    struct RecordingValidator {
        calls: Mutex<Vec<String>>,
        fail_activation: bool,
    }

    impl RecordingValidator {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("lock").clone()
        }
    }

    impl BlockValidator for RecordingValidator {
        fn load_external_block_file(
            &self,
            source: &mut dyn Read,
            _file_position: Option<u32>,
            _interrupt: &InterruptToken,
        ) -> Result<ImportStats, ValidationError> {
            let mut contents = String::new();
            source.read_to_string(&mut contents).expect("read");
            self.calls.lock().expect("lock").push(contents);
            Ok(ImportStats {
                records: 1,
                accepted: 1,
                ..ImportStats::default()
            })
        }

        fn activate_best_chain(
            &self,
            _interrupt: &InterruptToken,
        ) -> Result<ActivationReport, ValidationError> {
            self.calls.lock().expect("lock").push("activate".to_string());
            if self.fail_activation {
                return Err(ValidationError::Inconsistent("no usable tip".to_string()));
            }
            Ok(ActivationReport::default())
        }

        fn verify_recent_blocks(
            &self,
            _depth: u32,
            level: u32,
            _interrupt: &InterruptToken,
        ) -> Result<VerifyReport, ValidationError> {
            Ok(VerifyReport {
                level,
                ..VerifyReport::default()
            })
        }

        fn rewind_block_index(&self) -> Result<RewindOutcome, ValidationError> {
            Ok(RewindOutcome::NotNeeded)
        }

        fn init_block_index(&self) -> Result<bool, ValidationError> {
            Ok(false)
        }

        fn chain_tip(&self) -> Option<ChainTip> {
            None
        }
    }

    fn unloaded_store(dir: &Path) -> Arc<ChainStateStore> {
        Arc::new(ChainStateStore::new(
            StoreLayout::new(dir),
            Arc::new(MemoryOpener::new()),
            chain_params(Network::Regtest).message_start,
        ))
    }

    #[test]
    fn plan_orders_reindex_then_bootstrap_then_requested_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(BOOTSTRAP_FILE_NAME), b"boot").expect("bootstrap");
        let files = vec![dir.path().join("a.dat"), dir.path().join("b.dat")];
        let job = ImportJob::plan(true, dir.path(), &files);
        assert_eq!(
            job.sources,
            vec![
                ImportSource::ReindexScan,
                ImportSource::Bootstrap(dir.path().join(BOOTSTRAP_FILE_NAME)),
                ImportSource::File(files[0].clone()),
                ImportSource::File(files[1].clone()),
            ]
        );
        assert!(ImportJob::plan(false, &dir.path().join("missing"), &[]).is_empty());
    }

    #[test]
    fn files_are_imported_in_order_and_bootstrap_is_retired() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bootstrap = dir.path().join(BOOTSTRAP_FILE_NAME);
        fs::write(&bootstrap, b"boot").expect("bootstrap");
        fs::write(dir.path().join("second.dat"), b"second").expect("second");
        fs::write(dir.path().join("first.dat"), b"first").expect("first");
        let job = ImportJob::plan(
            false,
            dir.path(),
            &[
                dir.path().join("first.dat"),
                dir.path().join("missing.dat"),
                dir.path().join("second.dat"),
            ],
        );

        let validator = Arc::new(RecordingValidator::default());
        let (genesis_tx, _genesis_rx) = watch::channel(false);
        let report = ImportPipeline::new(
            unloaded_store(dir.path()),
            validator.clone(),
            InterruptToken::never(),
            ShutdownRequest::new(),
            genesis_tx,
        )
        .run(&job)
        .expect("import");

        assert_eq!(validator.calls(), vec!["boot", "first", "second", "activate"]);
        assert_eq!(report.files.len(), 3);
        assert_eq!(report.blocks_accepted, 3);
        assert!(!bootstrap.exists());
        assert!(dir.path().join(BOOTSTRAP_OLD_FILE_NAME).exists());
        assert!(!report.dump_mempool);
    }

    #[test]
    fn interrupted_import_skips_activation() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.dat"), b"a").expect("a");
        let validator = Arc::new(RecordingValidator::default());
        let (source, token) = interrupt_channel();
        source.interrupt();
        let (genesis_tx, _genesis_rx) = watch::channel(false);
        let pipeline = ImportPipeline::new(
            unloaded_store(dir.path()),
            validator.clone(),
            token,
            ShutdownRequest::new(),
            genesis_tx,
        );
        let report = pipeline
            .run(&ImportJob::plan(false, dir.path(), &[dir.path().join("a.dat")]))
            .expect("run");
        assert!(report.interrupted);
        assert!(validator.calls().is_empty());
    }

    #[test]
    fn activation_failure_requests_shutdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let validator = Arc::new(RecordingValidator {
            fail_activation: true,
            ..RecordingValidator::default()
        });
        let shutdown = ShutdownRequest::new();
        let (genesis_tx, _genesis_rx) = watch::channel(false);
        let handle = ImportPipeline::new(
            unloaded_store(dir.path()),
            validator,
            InterruptToken::never(),
            shutdown.clone(),
            genesis_tx,
        )
        .spawn(ImportJob::default())
        .expect("spawn");
        let result = handle.join().expect("joined");
        assert!(matches!(result, Err(ImportError::Activation(_))));
        assert!(shutdown.is_requested());
    }

    #[test]
    fn stop_after_import_requests_shutdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let shutdown = ShutdownRequest::new();
        let (genesis_tx, _genesis_rx) = watch::channel(false);
        let report = ImportPipeline::new(
            unloaded_store(dir.path()),
            Arc::new(RecordingValidator::default()),
            InterruptToken::never(),
            shutdown.clone(),
            genesis_tx,
        )
        .with_stop_after_import(true)
        .run(&ImportJob::default())
        .expect("run");
        assert!(report.activation.is_some());
        assert!(shutdown.is_requested());
    }

    #[test]
    fn activation_connects_genesis_and_raises_the_signal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let params = chain_params(Network::Regtest);
        let store = unloaded_store(dir.path());
        store
            .construct(
                &CacheBudget {
                    block_index_cache_bytes: 1 << 20,
                    chain_state_cache_bytes: 1 << 20,
                    in_memory_state_cache_bytes: 1 << 20,
                    mempool_max_bytes: 0,
                },
                WipeDirective::default(),
            )
            .expect("construct");
        let validator = Arc::new(ChainValidator::new(
            Arc::clone(&store),
            params.clone(),
            ValidatorOptions::default(),
        ));
        assert!(validator.init_block_index().expect("init"));

        let mempool = Arc::new(Mutex::new(Mempool::new(1 << 20)));
        let (genesis_tx, genesis_rx) = watch::channel(false);
        let report = ImportPipeline::new(
            Arc::clone(&store),
            validator,
            InterruptToken::never(),
            ShutdownRequest::new(),
            genesis_tx,
        )
        .with_mempool_reload(dir.path().join("mempool.dat"), mempool)
        .run(&ImportJob::default())
        .expect("run");

        assert!(*genesis_rx.borrow());
        assert_eq!(report.activation.map(|a| a.connected), Some(1));
        assert_eq!(report.mempool, Some(MempoolLoadStats::default()));
        assert!(report.dump_mempool);
        assert_eq!(
            store.handle().and_then(|h| h.main().best_block()),
            Some(params.genesis_hash)
        );
    }
}
