use dualchaind::budget::{
    split_cache, BudgetError, BudgetRequest, ResourceBudgeter, IN_MEMORY_CACHE_FLOOR_MIB,
    LOW_MEMORY_MAX_PEER_CONNECTIONS, MAX_ADDNODE_CONNECTIONS, MAX_DB_CACHE_MIB,
    MIN_CORE_FILEDESCRIPTORS, MIN_DB_CACHE_MIB,
};
use dualchaind::host::HostCapacity;

const MIB: u64 = 1024 * 1024;

struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.state
    }

    fn below(&mut self, bound: u64) -> u64 {
        (self.next_u64() >> 11) % bound
    }
}

fn roomy_host() -> HostCapacity {
    HostCapacity {
        physical_memory_bytes: Some(16 * 1024 * MIB),
        fd_limit: 1 << 20,
    }
}

#[test]
fn split_always_accounts_for_every_byte() {
    let mut rng = Lcg::new(0x5eed);
    for _ in 0..2000 {
        let total = (MIN_DB_CACHE_MIB + rng.below(MAX_DB_CACHE_MIB)) * MIB;
        let mempool = rng.below(4096) * 1_000_000;
        let txindex = rng.below(2) == 1;
        let budget = split_cache(total, txindex, mempool);
        assert_eq!(budget.total(), total);
        assert!(budget.mempool_max_bytes <= mempool);
        assert!(budget.in_memory_state_cache_bytes >= IN_MEMORY_CACHE_FLOOR_MIB * MIB);
    }
}

#[test]
fn requested_cache_is_clamped_to_the_supported_range() {
    let budgeter = ResourceBudgeter::new(roomy_host());
    for (requested, expected) in [
        (0, MIN_DB_CACHE_MIB),
        (1, MIN_DB_CACHE_MIB),
        (100, 100),
        (MAX_DB_CACHE_MIB * 4, MAX_DB_CACHE_MIB),
    ] {
        let resolved = budgeter
            .resolve(&BudgetRequest {
                db_cache_mib: Some(requested),
                ..BudgetRequest::default()
            })
            .expect("resolve");
        assert_eq!(resolved.total_cache_bytes, expected * MIB, "dbcache={requested}");
        assert_eq!(resolved.budget.total(), resolved.total_cache_bytes);
    }
}

#[test]
fn connections_shrink_to_fit_the_descriptor_limit() {
    let mut rng = Lcg::new(7);
    for _ in 0..500 {
        let fd_limit = MIN_CORE_FILEDESCRIPTORS + rng.below(400);
        let bind_count = rng.below(4) as usize;
        let requested = rng.below(1000) as usize;
        let resolved = ResourceBudgeter::new(HostCapacity {
            physical_memory_bytes: None,
            fd_limit,
        })
        .resolve(&BudgetRequest {
            max_connections: Some(requested),
            bind_count,
            ..BudgetRequest::default()
        })
        .expect("enough descriptors for the core");
        let available = fd_limit
            .saturating_sub(MIN_CORE_FILEDESCRIPTORS)
            .saturating_sub(bind_count.max(1) as u64)
            .saturating_sub(MAX_ADDNODE_CONNECTIONS) as usize;
        assert_eq!(resolved.max_connections, requested.min(available));
        let reduced = resolved
            .adjustments
            .iter()
            .any(|adjustment| adjustment.setting == "maxconnections");
        assert_eq!(reduced, requested > available);
    }
}

#[test]
fn too_few_descriptors_is_resource_exhaustion() {
    let err = ResourceBudgeter::new(HostCapacity {
        physical_memory_bytes: None,
        fd_limit: MIN_CORE_FILEDESCRIPTORS - 1,
    })
    .resolve(&BudgetRequest::default())
    .expect_err("below the core minimum");
    assert_eq!(
        err,
        BudgetError::ResourceExhausted {
            available: MIN_CORE_FILEDESCRIPTORS - 1,
            required: MIN_CORE_FILEDESCRIPTORS,
        }
    );
}

#[test]
fn low_memory_only_touches_unset_values() {
    let host = HostCapacity {
        physical_memory_bytes: Some(512 * MIB),
        fd_limit: 4096,
    };
    let defaults = ResourceBudgeter::new(host)
        .resolve(&BudgetRequest::default())
        .expect("resolve");
    assert!(defaults.low_memory);
    assert_eq!(defaults.max_connections, LOW_MEMORY_MAX_PEER_CONNECTIONS);
    assert_eq!(defaults.rpc_threads, 1);
    assert!(!defaults.reverse_headers);

    let explicit = ResourceBudgeter::new(host)
        .resolve(&BudgetRequest {
            max_connections: Some(90),
            rpc_threads: Some(6),
            reverse_headers: Some(true),
            ..BudgetRequest::default()
        })
        .expect("resolve");
    assert_eq!(explicit.max_connections, 90);
    assert_eq!(explicit.rpc_threads, 6);
    assert!(explicit.reverse_headers);
    assert!(explicit
        .adjustments
        .iter()
        .all(|adjustment| adjustment.setting != "maxconnections"));
}
