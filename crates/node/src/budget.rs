//! Turns requested cache/connection settings and host capacity into concrete budgets.

use std::fmt;

use dualchain_chainstate::CacheBudget;

use crate::host::HostCapacity;
use crate::{mb_to_bytes, mib_to_bytes};

pub const MIN_DB_CACHE_MIB: u64 = 4;
pub const MAX_DB_CACHE_MIB: u64 = 16384;
pub const DEFAULT_DB_CACHE_MIB: u64 = 450;
pub const MAX_BLOCK_DB_CACHE_MIB: u64 = 2;
pub const MAX_BLOCK_DB_AND_TXINDEX_CACHE_MIB: u64 = 1024;
pub const MAX_COINS_DB_CACHE_MIB: u64 = 8;
pub const IN_MEMORY_CACHE_FLOOR_MIB: u64 = 1;
pub const DEFAULT_MAX_MEMPOOL_MB: u64 = 300;
pub const DEFAULT_MAX_MEMPOOL_SIZE_LOWMEM_MB: u64 = 100;
pub const LOW_MEMORY_CACHE_MIB: u64 = 200;
pub const MIN_CORE_FILEDESCRIPTORS: u64 = 150;
pub const MAX_ADDNODE_CONNECTIONS: u64 = 8;
pub const DEFAULT_MAX_PEER_CONNECTIONS: usize = 125;
pub const LOW_MEMORY_MAX_PEER_CONNECTIONS: usize = 40;
pub const DEFAULT_RPC_THREADS: usize = 4;
pub const DEFAULT_REVERSE_HEADERS: bool = true;

/// What the operator asked for. `None` means "not set anywhere", which lets the
/// low-memory profile pick a value.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BudgetRequest {
    pub db_cache_mib: Option<u64>,
    pub txindex: bool,
    pub max_mempool_mb: Option<u64>,
    pub max_connections: Option<usize>,
    pub rpc_threads: Option<usize>,
    pub reverse_headers: Option<bool>,
    pub bind_count: usize,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Adjustment {
    pub setting: &'static str,
    pub requested: String,
    pub resolved: String,
    pub reason: &'static str,
}

impl fmt::Display for Adjustment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Reducing -{} from {} to {}, because of {}.",
            self.setting, self.requested, self.resolved, self.reason
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedResources {
    pub budget: CacheBudget,
    pub total_cache_bytes: u64,
    pub max_connections: usize,
    pub rpc_threads: usize,
    pub reverse_headers: bool,
    pub low_memory: bool,
    pub adjustments: Vec<Adjustment>,
}

impl ResolvedResources {
    pub fn log_summary(&self) {
        log_info!("Cache configuration:");
        log_info!(
            "* Using {:.1}MiB for block index database",
            as_mib(self.budget.block_index_cache_bytes)
        );
        log_info!(
            "* Using {:.1}MiB for chain state database",
            as_mib(self.budget.chain_state_cache_bytes)
        );
        log_info!(
            "* Using {:.1}MiB for in-memory UTXO set",
            as_mib(self.budget.in_memory_state_cache_bytes)
        );
        log_info!(
            "* Using {:.1}MiB for mempool",
            as_mib(self.budget.mempool_max_bytes)
        );
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BudgetError {
    ResourceExhausted { available: u64, required: u64 },
}

impl fmt::Display for BudgetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetError::ResourceExhausted {
                available,
                required,
            } => write!(
                f,
                "Not enough file descriptors available ({available} available, {required} required)."
            ),
        }
    }
}

impl std::error::Error for BudgetError {}

pub struct ResourceBudgeter {
    host: HostCapacity,
}

impl ResourceBudgeter {
    pub fn new(host: HostCapacity) -> Self {
        Self { host }
    }

    pub fn resolve(&self, request: &BudgetRequest) -> Result<ResolvedResources, BudgetError> {
        if self.host.fd_limit < MIN_CORE_FILEDESCRIPTORS {
            return Err(BudgetError::ResourceExhausted {
                available: self.host.fd_limit,
                required: MIN_CORE_FILEDESCRIPTORS,
            });
        }

        let low_memory = self.host.is_low_memory();
        let mut adjustments = Vec::new();
        let mut low_memory_default = |setting: &'static str, requested: String, resolved: String| {
            adjustments.push(Adjustment {
                setting,
                requested,
                resolved,
                reason: "low physical memory",
            });
        };

        let db_cache_mib = match request.db_cache_mib {
            Some(value) => value,
            None if low_memory => {
                low_memory_default(
                    "dbcache",
                    DEFAULT_DB_CACHE_MIB.to_string(),
                    LOW_MEMORY_CACHE_MIB.to_string(),
                );
                LOW_MEMORY_CACHE_MIB
            }
            None => DEFAULT_DB_CACHE_MIB,
        };
        let mempool_mb = match request.max_mempool_mb {
            Some(value) => value,
            None if low_memory => {
                low_memory_default(
                    "maxmempool",
                    DEFAULT_MAX_MEMPOOL_MB.to_string(),
                    DEFAULT_MAX_MEMPOOL_SIZE_LOWMEM_MB.to_string(),
                );
                DEFAULT_MAX_MEMPOOL_SIZE_LOWMEM_MB
            }
            None => DEFAULT_MAX_MEMPOOL_MB,
        };
        let mut max_connections = match request.max_connections {
            Some(value) => value,
            None if low_memory => {
                low_memory_default(
                    "maxconnections",
                    DEFAULT_MAX_PEER_CONNECTIONS.to_string(),
                    LOW_MEMORY_MAX_PEER_CONNECTIONS.to_string(),
                );
                LOW_MEMORY_MAX_PEER_CONNECTIONS
            }
            None => DEFAULT_MAX_PEER_CONNECTIONS,
        };
        let rpc_threads = match request.rpc_threads {
            Some(value) => value.max(1),
            None if low_memory => {
                low_memory_default("rpcthreads", DEFAULT_RPC_THREADS.to_string(), "1".to_string());
                1
            }
            None => DEFAULT_RPC_THREADS,
        };
        let reverse_headers = match request.reverse_headers {
            Some(value) => value,
            None if low_memory => {
                low_memory_default("reverseheaders", "1".to_string(), "0".to_string());
                false
            }
            None => DEFAULT_REVERSE_HEADERS,
        };

        let binds = request.bind_count.max(1) as u64;
        let available = self
            .host
            .fd_limit
            .saturating_sub(MIN_CORE_FILEDESCRIPTORS)
            .saturating_sub(binds)
            .saturating_sub(MAX_ADDNODE_CONNECTIONS);
        let available = usize::try_from(available).unwrap_or(usize::MAX);
        if max_connections > available {
            adjustments.push(Adjustment {
                setting: "maxconnections",
                requested: max_connections.to_string(),
                resolved: available.to_string(),
                reason: "system limitations",
            });
            max_connections = available;
        }

        let total_cache_bytes = mib_to_bytes(db_cache_mib.clamp(MIN_DB_CACHE_MIB, MAX_DB_CACHE_MIB));
        let requested_mempool_bytes = mb_to_bytes(mempool_mb);
        let budget = split_cache(total_cache_bytes, request.txindex, requested_mempool_bytes);
        if budget.mempool_max_bytes < requested_mempool_bytes {
            adjustments.push(Adjustment {
                setting: "maxmempool",
                requested: format!("{mempool_mb}MB"),
                resolved: format!("{}MB", budget.mempool_max_bytes / 1_000_000),
                reason: "the total cache budget",
            });
        }

        for adjustment in &adjustments {
            log_warn!("Warning: {adjustment}");
        }

        Ok(ResolvedResources {
            budget,
            total_cache_bytes,
            max_connections,
            rpc_threads,
            reverse_headers,
            low_memory,
            adjustments,
        })
    }
}

/// Splits an already clamped total across the caches. The block index takes an
/// eighth (capped), the chain-state database a quarter to half of what is left (capped),
/// and the rest is shared by the mempool and the in-memory coin cache, which always
/// keeps its floor when the total allows it.
pub fn split_cache(total_bytes: u64, txindex: bool, mempool_request_bytes: u64) -> CacheBudget {
    let block_index_cap = if txindex {
        MAX_BLOCK_DB_AND_TXINDEX_CACHE_MIB
    } else {
        MAX_BLOCK_DB_CACHE_MIB
    };
    let block_index = (total_bytes / 8).min(mib_to_bytes(block_index_cap));
    let remainder = total_bytes - block_index;

    let chain_state = (remainder / 2)
        .min(remainder / 4 + mib_to_bytes(8))
        .min(mib_to_bytes(MAX_COINS_DB_CACHE_MIB));
    let remainder = remainder - chain_state;

    let mempool = mempool_request_bytes
        .min(remainder.saturating_sub(mib_to_bytes(IN_MEMORY_CACHE_FLOOR_MIB)));
    CacheBudget {
        block_index_cache_bytes: block_index,
        chain_state_cache_bytes: chain_state,
        in_memory_state_cache_bytes: remainder - mempool,
        mempool_max_bytes: mempool,
    }
}

fn as_mib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}
