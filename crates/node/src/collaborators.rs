//! Interfaces to the subsystems the node drives but does not implement, plus the
//! minimal implementations the daemon ships with.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use dualchain_chainstate::store::StoreOpener;

use crate::backend::store_opener;
use crate::config::Config;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub trait WalletBackend: Send + Sync {
    fn verify(&self) -> Result<(), String>;
    fn init_load_wallet(&self) -> Result<(), String>;
    /// `is_final` is set for the last flush before the process exits.
    fn flush(&self, is_final: bool);
    fn post_init_process(&self);
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BindFlags {
    pub whitelisted: bool,
    /// Log the failure as an error rather than a warning.
    pub report_error: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NetworkStartOptions {
    pub max_connections: usize,
    /// Cleared while pruning: the node cannot serve historical blocks.
    pub advertise_full_node: bool,
    pub reverse_headers: bool,
}

pub trait NetworkEngine: Send + Sync {
    /// Returns the address actually bound.
    fn bind(&self, addr: SocketAddr, flags: BindFlags) -> Result<SocketAddr, String>;
    fn start(&self, options: NetworkStartOptions) -> Result<(), String>;
    /// Asks every worker to stop. Does not wait.
    fn interrupt(&self);
    /// Joins the workers and closes every listener.
    fn stop(&self);
}

pub trait InitNotifier: Send + Sync {
    fn on_init_message(&self, text: &str);
    /// `true` approves the offered recovery.
    fn on_recovery_question(&self, prompt: &str) -> bool;
}

/// Everything the orchestrator needs from outside its own crate.
#[derive(Clone)]
pub struct Collaborators {
    pub wallet: Arc<dyn WalletBackend>,
    pub network: Arc<dyn NetworkEngine>,
    pub notifier: Arc<dyn InitNotifier>,
    pub opener: Arc<dyn StoreOpener>,
}

impl Collaborators {
    pub fn reference(config: &Config) -> Self {
        Self {
            wallet: Arc::new(DisabledWallet),
            network: Arc::new(ListenerEngine::new()),
            notifier: Arc::new(ConsoleNotifier::new(false)),
            opener: store_opener(config.backend),
        }
    }
}

/// Stands in when no wallet is compiled in.
pub struct DisabledWallet;

impl WalletBackend for DisabledWallet {
    fn verify(&self) -> Result<(), String> {
        Ok(())
    }

    fn init_load_wallet(&self) -> Result<(), String> {
        log_info!("Wallet disabled!");
        Ok(())
    }

    fn flush(&self, _is_final: bool) {}

    fn post_init_process(&self) {}
}

/// Logs init messages. A daemon has nobody to ask, so recovery questions get the
/// configured answer.
pub struct ConsoleNotifier {
    approve_recovery: bool,
}

impl ConsoleNotifier {
    pub fn new(approve_recovery: bool) -> Self {
        Self { approve_recovery }
    }
}

impl InitNotifier for ConsoleNotifier {
    fn on_init_message(&self, text: &str) {
        log_info!("init message: {text}");
    }

    fn on_recovery_question(&self, prompt: &str) -> bool {
        if self.approve_recovery {
            log_warn!("{prompt} (answering yes)");
        } else {
            log_error!("{prompt} (answering no; restart with --reindex to rebuild)");
        }
        self.approve_recovery
    }
}

/// Binds and accepts, then closes every connection. It speaks no wire protocol.
#[derive(Default)]
pub struct ListenerEngine {
    listeners: Mutex<Vec<(TcpListener, BindFlags)>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    interrupted: Arc<AtomicBool>,
    accepted: Arc<AtomicU64>,
}

impl ListenerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accepted_connections(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl NetworkEngine for ListenerEngine {
    fn bind(&self, addr: SocketAddr, flags: BindFlags) -> Result<SocketAddr, String> {
        let listener = TcpListener::bind(addr).map_err(|err| {
            let message = format!("Unable to bind to {addr} on this computer: {err}");
            if flags.report_error {
                log_error!("{message}");
            } else {
                log_warn!("{message}");
            }
            message
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|err| format!("failed to configure listener {addr}: {err}"))?;
        let local = listener.local_addr().map_err(|err| err.to_string())?;
        log_info!("Bound to {local}{}", if flags.whitelisted { " (whitelisted)" } else { "" });
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((listener, flags));
        Ok(local)
    }

    fn start(&self, options: NetworkStartOptions) -> Result<(), String> {
        let listeners: Vec<(TcpListener, BindFlags)> = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        log_info!(
            "Network engine starting ({} listener(s), maxconnections={}, full node service {})",
            listeners.len(),
            options.max_connections,
            if options.advertise_full_node { "advertised" } else { "not advertised" }
        );
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (listener, _flags) in listeners {
            let interrupted = Arc::clone(&self.interrupted);
            let accepted = Arc::clone(&self.accepted);
            let handle = thread::Builder::new()
                .name("net-accept".to_string())
                .spawn(move || accept_loop(listener, interrupted, accepted))
                .map_err(|err| format!("failed to spawn accept worker: {err}"))?;
            workers.push(handle);
        }
        Ok(())
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.interrupt();
        let workers: Vec<thread::JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for worker in workers {
            if worker.join().is_err() {
                log_warn!("network accept worker panicked");
            }
        }
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

fn accept_loop(listener: TcpListener, interrupted: Arc<AtomicBool>, accepted: Arc<AtomicU64>) {
    while !interrupted.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                accepted.fetch_add(1, Ordering::Relaxed);
                log_debug!("Closing inbound connection from {peer}");
                drop(stream);
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) => {
                log_warn!("accept failed: {err}");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}
