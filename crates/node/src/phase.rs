//! Lifecycle phases and the process-wide shutdown request.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use dualchain_chainstate::interrupt::{interrupt_channel, InterruptSource, InterruptToken};
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum LifecyclePhase {
    Unstarted,
    SanityChecked,
    ParametersResolved,
    StoreLoading,
    StoreLoaded,
    WalletLoaded,
    ServicesStarted,
    Importing,
    Running,
    Interrupting,
    ShuttingDown,
    Stopped,
}

impl LifecyclePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecyclePhase::Unstarted => "unstarted",
            LifecyclePhase::SanityChecked => "sanity-checked",
            LifecyclePhase::ParametersResolved => "parameters-resolved",
            LifecyclePhase::StoreLoading => "store-loading",
            LifecyclePhase::StoreLoaded => "store-loaded",
            LifecyclePhase::WalletLoaded => "wallet-loaded",
            LifecyclePhase::ServicesStarted => "services-started",
            LifecyclePhase::Importing => "importing",
            LifecyclePhase::Running => "running",
            LifecyclePhase::Interrupting => "interrupting",
            LifecyclePhase::ShuttingDown => "shutting-down",
            LifecyclePhase::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PhaseError {
    pub from: LifecyclePhase,
    pub to: LifecyclePhase,
}

impl fmt::Display for PhaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid lifecycle transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for PhaseError {}

struct PhaseState {
    current: LifecyclePhase,
    store_loading_restarts: u32,
    /// `None` once the subscribers have been released.
    tx: Option<watch::Sender<LifecyclePhase>>,
}

impl PhaseState {
    fn publish(&mut self, next: LifecyclePhase) {
        self.current = next;
        if let Some(tx) = &self.tx {
            tx.send_replace(next);
        }
    }
}

/// Forward-only phase tracker. `StoreLoading` may be re-entered exactly once, for an
/// approved reindex.
pub struct PhaseTracker {
    state: Mutex<PhaseState>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LifecyclePhase::Unstarted);
        Self {
            state: Mutex::new(PhaseState {
                current: LifecyclePhase::Unstarted,
                store_loading_restarts: 0,
                tx: Some(tx),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PhaseState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn current(&self) -> LifecyclePhase {
        self.lock().current
    }

    /// After [`PhaseTracker::release_subscribers`] the receiver is already closed and
    /// holds the phase at the time of the call.
    pub fn subscribe(&self) -> watch::Receiver<LifecyclePhase> {
        let state = self.lock();
        match &state.tx {
            Some(tx) => tx.subscribe(),
            None => watch::channel(state.current).1,
        }
    }

    /// Detaches every subscriber. Their next `changed()` reports the channel closed.
    pub fn release_subscribers(&self) -> bool {
        let released = self.lock().tx.take();
        match released {
            Some(tx) => {
                log_debug!("Releasing {} lifecycle subscriber(s)", tx.receiver_count());
                true
            }
            None => false,
        }
    }

    pub fn advance(&self, next: LifecyclePhase) -> Result<(), PhaseError> {
        let mut state = self.lock();
        let current = state.current;
        let allowed = if next == LifecyclePhase::StoreLoading && current == next {
            state.store_loading_restarts == 0
        } else {
            next > current
        };
        if !allowed {
            return Err(PhaseError {
                from: current,
                to: next,
            });
        }
        if current == next {
            state.store_loading_restarts += 1;
        }
        log_debug!("Lifecycle: {current} -> {next}");
        state.publish(next);
        Ok(())
    }

    /// Moves forward to `next` unless the tracker is already there or beyond.
    pub fn advance_to_at_least(&self, next: LifecyclePhase) {
        let mut state = self.lock();
        if state.current < next {
            log_debug!("Lifecycle: {} -> {next}", state.current);
            state.publish(next);
        }
    }
}

/// Raised by signals, the RPC `stop` call, or a fatal import error. Everything waiting
/// for the node to wind down observes the same flag.
#[derive(Clone)]
pub struct ShutdownRequest {
    source: InterruptSource,
}

impl Default for ShutdownRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownRequest {
    pub fn new() -> Self {
        let (source, _token) = interrupt_channel();
        Self { source }
    }

    pub fn request(&self) {
        self.source.interrupt();
    }

    pub fn is_requested(&self) -> bool {
        self.source.is_interrupted()
    }

    pub fn token(&self) -> InterruptToken {
        self.source.token()
    }

    pub async fn wait(&self) {
        self.token().interrupted().await;
    }
}
