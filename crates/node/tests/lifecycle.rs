use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dualchain_chainstate::catcher::ReadFault;
use dualchain_chainstate::store::{MemoryOpener, StoreKind, StoreOpener};
use dualchain_primitives::OutPoint;
use dualchain_storage::{
    Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch,
};
use dualchaind::collaborators::{Collaborators, DisabledWallet, InitNotifier, ListenerEngine};
use dualchaind::config::{parse_args_from, CliAction, Config};
use dualchaind::host::HostCapacity;
use dualchaind::lifecycle::{InitError, Orchestrator, ShutdownStep, StartupOutcome};
use dualchaind::phase::LifecyclePhase;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn host() -> HostCapacity {
    HostCapacity {
        physical_memory_bytes: Some(8 * 1024 * 1024 * 1024),
        fd_limit: 4096,
    }
}

fn config(dir: &Path, extra: &[&str]) -> Config {
    let mut args: Vec<String> = [
        "--datadir",
        dir.to_str().expect("utf8 path"),
        "--regtest",
        "--printtoconsole",
        "--rpcbind",
        "127.0.0.1:0",
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect();
    if !extra.contains(&"--bind") {
        args.extend(["--bind".to_string(), "127.0.0.1:0".to_string()]);
    }
    args.extend(extra.iter().map(|arg| arg.to_string()));
    match parse_args_from(args).expect("parse") {
        CliAction::Run(config) => config,
        _ => panic!("expected a run config"),
    }
}

#[derive(Default)]
struct ScriptedNotifier {
    approve: bool,
    questions: AtomicUsize,
    messages: Mutex<Vec<String>>,
}

impl ScriptedNotifier {
    fn answering(approve: bool) -> Arc<Self> {
        Arc::new(Self {
            approve,
            ..Self::default()
        })
    }

    fn questions(&self) -> usize {
        self.questions.load(Ordering::SeqCst)
    }
}

impl InitNotifier for ScriptedNotifier {
    fn on_init_message(&self, text: &str) {
        self.messages
            .lock()
            .expect("messages")
            .push(text.to_string());
    }

    fn on_recovery_question(&self, _prompt: &str) -> bool {
        self.questions.fetch_add(1, Ordering::SeqCst);
        self.approve
    }
}

/// Every block index open fails, as if the database were unreadable.
struct BrokenIndexOpener {
    inner: MemoryOpener,
}

impl StoreOpener for BrokenIndexOpener {
    fn open(
        &self,
        kind: StoreKind,
        path: &Path,
        cache_bytes: u64,
    ) -> Result<Arc<dyn KeyValueStore>, StoreError> {
        if kind == StoreKind::BlockIndex {
            return Err(StoreError::Backend("block index unreadable".to_string()));
        }
        self.inner.open(kind, path, cache_bytes)
    }

    fn destroy(&self, kind: StoreKind, path: &Path) -> Result<(), StoreError> {
        self.inner.destroy(kind, path)
    }
}

const UNREADABLE: [u8; 32] = [0xfa; 32];

static FATAL_READS: AtomicUsize = AtomicUsize::new(0);

fn count_and_panic(fault: &ReadFault) -> ! {
    FATAL_READS.fetch_add(1, Ordering::SeqCst);
    panic!("fatal read fault: {fault}")
}

/// Main coin store where one outpoint cannot be read back.
struct BadSectorStore {
    inner: Arc<dyn KeyValueStore>,
    unreadable: Vec<u8>,
}

impl KeyValueStore for BadSectorStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if column == Column::Coin && key == self.unreadable.as_slice() {
            return Err(StoreError::Backend("read error on coin record".to_string()));
        }
        self.inner.get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.inner.put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.inner.delete(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.inner.scan_prefix(column, prefix)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        self.inner.for_each_prefix(column, prefix, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.inner.write_batch(batch)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.inner.flush()
    }
}

struct BadSectorOpener {
    inner: MemoryOpener,
}

impl StoreOpener for BadSectorOpener {
    fn open(
        &self,
        kind: StoreKind,
        path: &Path,
        cache_bytes: u64,
    ) -> Result<Arc<dyn KeyValueStore>, StoreError> {
        let store = self.inner.open(kind, path, cache_bytes)?;
        if kind != StoreKind::ChainState {
            return Ok(store);
        }
        Ok(Arc::new(BadSectorStore {
            inner: store,
            unreadable: OutPoint::new(UNREADABLE, 0).to_key().to_vec(),
        }))
    }

    fn destroy(&self, kind: StoreKind, path: &Path) -> Result<(), StoreError> {
        self.inner.destroy(kind, path)
    }
}

fn collaborators(opener: Arc<dyn StoreOpener>, notifier: Arc<dyn InitNotifier>) -> Collaborators {
    Collaborators {
        wallet: Arc::new(DisabledWallet),
        network: Arc::new(ListenerEngine::new()),
        notifier,
        opener,
    }
}

fn orchestrator(dir: &Path, extra: &[&str], opener: Arc<dyn StoreOpener>) -> Orchestrator {
    Orchestrator::new(
        config(dir, extra),
        host(),
        collaborators(opener, ScriptedNotifier::answering(false)),
    )
}

fn regtest_dir(dir: &Path) -> PathBuf {
    dir.join("regtest")
}

async fn rpc_call(addr: SocketAddr, body: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let request = format!(
        "POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.expect("write");
    let mut response = String::new();
    stream.read_to_string(&mut response).await.expect("read");
    response
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_datadir_boots_to_running_and_shuts_down_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let node = Arc::new(orchestrator(dir.path(), &[], Arc::new(MemoryOpener::new())));

    let outcome = node.startup().await.expect("startup");
    assert_eq!(outcome, StartupOutcome::Running);
    assert_eq!(node.phase(), LifecyclePhase::Running);
    assert_eq!(node.chain_tip().expect("tip").height, 0);
    assert_eq!(node.bound_addrs().len(), 1);
    assert!(node.rpc_addr().is_some());
    assert!(regtest_dir(dir.path()).join("dualchaind.pid").exists());

    let first = {
        let node = Arc::clone(&node);
        tokio::spawn(async move { node.shutdown().await })
    };
    let second = {
        let node = Arc::clone(&node);
        tokio::spawn(async move { node.shutdown().await })
    };
    let first = first.await.expect("join");
    let second = second.await.expect("join");
    let report = match (first, second) {
        (Some(report), None) | (None, Some(report)) => report,
        other => panic!("shutdown must run exactly once, got {other:?}"),
    };
    assert_eq!(report.steps.first(), Some(&ShutdownStep::Interrupt));
    assert_eq!(report.steps.last(), Some(&ShutdownStep::Done));
    let teardown = report.teardown.expect("store was open");
    assert!(teardown.released_main);
    assert!(teardown.flush_error.is_none());
    assert_eq!(node.phase(), LifecyclePhase::Stopped);
    assert!(!regtest_dir(dir.path()).join("dualchaind.pid").exists());
    assert!(regtest_dir(dir.path()).join("fee_estimates.dat").exists());
    assert!(regtest_dir(dir.path()).join("mempool.dat").exists());
    assert!(node.shutdown().await.is_none());
    assert_eq!(node.import_failure(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_before_startup_is_harmless() {
    let dir = tempfile::tempdir().expect("tempdir");
    let node = orchestrator(dir.path(), &[], Arc::new(MemoryOpener::new()));
    let report = node.shutdown().await.expect("first call runs");
    assert!(report.teardown.is_none());
    assert!(report.erased.is_empty());
    assert_eq!(node.phase(), LifecyclePhase::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn declined_recovery_does_not_start() {
    let dir = tempfile::tempdir().expect("tempdir");
    let notifier = ScriptedNotifier::answering(false);
    let opener = Arc::new(BrokenIndexOpener {
        inner: MemoryOpener::new(),
    });
    let node = Orchestrator::new(
        config(dir.path(), &[]),
        host(),
        collaborators(opener, notifier.clone()),
    );

    let outcome = node.startup().await.expect("declining is not an error");
    assert_eq!(outcome, StartupOutcome::DidNotStart);
    assert_eq!(notifier.questions(), 1);
    assert_eq!(node.phase(), LifecyclePhase::StoreLoading);
    node.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn reindex_launch_failure_is_fatal_without_asking() {
    let dir = tempfile::tempdir().expect("tempdir");
    let notifier = ScriptedNotifier::answering(false);
    let opener = Arc::new(BrokenIndexOpener {
        inner: MemoryOpener::new(),
    });
    let node = Orchestrator::new(
        config(dir.path(), &["--reindex"]),
        host(),
        collaborators(opener, notifier.clone()),
    );

    let err = node
        .startup()
        .await
        .expect_err("a rebuild was already requested");
    assert!(matches!(err, InitError::Storage(_)), "unexpected error {err:?}");
    assert_eq!(notifier.questions(), 0);
    node.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_after_approved_reindex_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let notifier = ScriptedNotifier::answering(true);
    let opener = Arc::new(BrokenIndexOpener {
        inner: MemoryOpener::new(),
    });
    let node = Orchestrator::new(
        config(dir.path(), &[]),
        host(),
        collaborators(opener, notifier.clone()),
    );

    let err = node.startup().await.expect_err("second failure is final");
    assert!(matches!(err, InitError::Storage(_)), "unexpected error {err:?}");
    assert_eq!(notifier.questions(), 1);
    node.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn txindex_toggle_reindexes_after_approval() {
    let dir = tempfile::tempdir().expect("tempdir");
    let opener: Arc<dyn StoreOpener> = Arc::new(MemoryOpener::new());

    let first = orchestrator(dir.path(), &[], Arc::clone(&opener));
    assert_eq!(first.startup().await.expect("first boot"), StartupOutcome::Running);
    first.shutdown().await.expect("first shutdown");

    let notifier = ScriptedNotifier::answering(true);
    let second = Orchestrator::new(
        config(dir.path(), &["--txindex"]),
        host(),
        collaborators(opener, notifier.clone()),
    );
    assert_eq!(second.startup().await.expect("second boot"), StartupOutcome::Running);
    assert_eq!(notifier.questions(), 1);
    assert!(notifier
        .messages
        .lock()
        .expect("messages")
        .iter()
        .any(|text| text == "Loading block index..."));
    assert_eq!(second.chain_tip().expect("tip").height, 0);
    second.shutdown().await.expect("second shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn rpc_stop_ends_a_running_node() {
    let dir = tempfile::tempdir().expect("tempdir");
    let node = orchestrator(dir.path(), &[], Arc::new(MemoryOpener::new()));
    assert_eq!(node.startup().await.expect("startup"), StartupOutcome::Running);
    let addr = node.rpc_addr().expect("rpc enabled");

    let info = rpc_call(addr, r#"{"method":"getinfo","id":1}"#).await;
    assert!(info.contains("\"blocks\":0"), "unexpected response {info}");

    let response = rpc_call(addr, r#"{"method":"stop","id":2}"#).await;
    assert!(response.contains("stopping"));
    tokio::time::timeout(Duration::from_secs(5), node.wait_for_shutdown_request())
        .await
        .expect("stop raises the shutdown request");
    node.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_after_import_shuts_down_on_its_own() {
    let dir = tempfile::tempdir().expect("tempdir");
    let node = orchestrator(
        dir.path(),
        &["--stopafterblockimport", "--no-server"],
        Arc::new(MemoryOpener::new()),
    );
    let outcome = node.startup().await.expect("startup");
    if outcome == StartupOutcome::Running {
        tokio::time::timeout(Duration::from_secs(5), node.wait_for_shutdown_request())
            .await
            .expect("import requests shutdown");
    }
    assert!(node.shutdown_request().is_requested());
    assert!(node.rpc_addr().is_none());
    node.shutdown().await.expect("shutdown");
    assert_eq!(node.import_failure(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn no_usable_listener_is_a_bind_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let taken = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = taken.local_addr().expect("addr").to_string();
    let node = orchestrator(
        dir.path(),
        &["--bind", &addr, "--no-server"],
        Arc::new(MemoryOpener::new()),
    );
    let err = node.startup().await.expect_err("every listener is taken");
    assert!(matches!(err, InitError::NetworkBindFailure(_)));
    node.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn erase_directive_runs_after_teardown() {
    let dir = tempfile::tempdir().expect("tempdir");
    let node = orchestrator(
        dir.path(),
        &["--erase-on-shutdown", "all"],
        Arc::new(MemoryOpener::new()),
    );
    assert_eq!(node.startup().await.expect("startup"), StartupOutcome::Running);
    let blocks = regtest_dir(dir.path()).join("blocks");
    assert!(blocks.exists());

    let report = node.shutdown().await.expect("shutdown");
    assert!(report.erased.contains(&blocks));
    assert!(!blocks.exists());
    let teardown_at = report
        .steps
        .iter()
        .position(|step| *step == ShutdownStep::StoreTeardown)
        .expect("teardown step");
    let erase_at = report
        .steps
        .iter()
        .position(|step| *step == ShutdownStep::ApplyDirective)
        .expect("directive step");
    assert!(teardown_at < erase_at);
}

#[tokio::test(flavor = "multi_thread")]
async fn second_node_cannot_lock_the_same_datadir() {
    let dir = tempfile::tempdir().expect("tempdir");
    let first = orchestrator(dir.path(), &[], Arc::new(MemoryOpener::new()));
    assert_eq!(first.startup().await.expect("startup"), StartupOutcome::Running);

    let second = orchestrator(
        dir.path(),
        &["--erase-on-shutdown", "all"],
        Arc::new(MemoryOpener::new()),
    );
    let err = second.startup().await.expect_err("datadir is locked");
    assert!(matches!(err, InitError::Config(_)));
    let report = second.shutdown().await.expect("shutdown");
    assert!(report.erased.is_empty(), "a node without the lock must not erase");
    assert!(regtest_dir(dir.path()).join("blocks").exists());

    first.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn phase_subscribers_follow_boot_and_are_released_at_shutdown() {
    let dir = tempfile::tempdir().expect("tempdir");
    let node = orchestrator(dir.path(), &[], Arc::new(MemoryOpener::new()));
    let mut rx = node.subscribe_phase();
    assert_eq!(*rx.borrow(), LifecyclePhase::Unstarted);
    let observer = tokio::spawn(async move {
        let mut seen = Vec::new();
        while rx.changed().await.is_ok() {
            seen.push(*rx.borrow_and_update());
        }
        seen
    });

    assert_eq!(node.startup().await.expect("startup"), StartupOutcome::Running);
    let report = node.shutdown().await.expect("shutdown");
    assert!(report.steps.contains(&ShutdownStep::ReleaseSubscribers));

    let seen = tokio::time::timeout(Duration::from_secs(5), observer)
        .await
        .expect("released subscribers stop waiting")
        .expect("join");
    assert!(seen.windows(2).all(|pair| pair[0] < pair[1]), "{seen:?}");
    assert_eq!(seen.last(), Some(&LifecyclePhase::ShuttingDown));
    assert_eq!(node.phase(), LifecyclePhase::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn main_view_read_fault_reaches_the_installed_handler() {
    let dir = tempfile::tempdir().expect("tempdir");
    let opener = Arc::new(BadSectorOpener {
        inner: MemoryOpener::new(),
    });
    let node = orchestrator(dir.path(), &[], opener).with_fatal_handler(count_and_panic);
    assert_eq!(node.startup().await.expect("startup"), StartupOutcome::Running);
    let handle = node
        .store()
        .and_then(|store| store.handle())
        .expect("chain state is loaded");

    let readable = Arc::clone(&handle);
    let coin = tokio::task::spawn_blocking(move || {
        readable.main().get_coin(&OutPoint::new([1u8; 32], 0))
    })
    .await
    .expect("healthy read");
    assert_eq!(coin, None);
    assert_eq!(FATAL_READS.load(Ordering::SeqCst), 0);

    let err = tokio::task::spawn_blocking(move || {
        handle.main().get_coin(&OutPoint::new(UNREADABLE, 0))
    })
    .await
    .expect_err("a backend error must never read as absent");
    assert!(err.is_panic());
    assert_eq!(FATAL_READS.load(Ordering::SeqCst), 1);

    node.shutdown().await.expect("shutdown");
}
