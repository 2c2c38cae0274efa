//! Bounded transaction pool and its `mempool.dat` snapshot.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dualchain_chainstate::interrupt::InterruptToken;
use dualchain_primitives::encoding::{Decoder, Encoder};
use dualchain_primitives::{Hash256, Transaction};

const MEMPOOL_FILE_VERSION: u32 = 1;
/// Per-entry bookkeeping charged on top of the raw transaction bytes.
const ENTRY_OVERHEAD_BYTES: u64 = 96;
const PERSIST_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MempoolEntry {
    pub txid: Hash256,
    pub raw: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MempoolError {
    AlreadyKnown,
    Full,
}

pub struct Mempool {
    entries: BTreeMap<Hash256, MempoolEntry>,
    usage_bytes: u64,
    max_bytes: u64,
    revision: u64,
}

impl Mempool {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            entries: BTreeMap::new(),
            usage_bytes: 0,
            max_bytes,
            revision: 0,
        }
    }

    pub fn insert(&mut self, tx: &Transaction) -> Result<Hash256, MempoolError> {
        let txid = tx.txid();
        if self.entries.contains_key(&txid) {
            return Err(MempoolError::AlreadyKnown);
        }
        let raw = dualchain_primitives::encoding::encode(tx);
        let cost = raw.len() as u64 + ENTRY_OVERHEAD_BYTES;
        if self.usage_bytes.saturating_add(cost) > self.max_bytes {
            return Err(MempoolError::Full);
        }
        self.usage_bytes += cost;
        self.entries.insert(txid, MempoolEntry { txid, raw });
        self.revision += 1;
        Ok(txid)
    }

    pub fn remove(&mut self, txid: &Hash256) -> bool {
        let Some(entry) = self.entries.remove(txid) else {
            return false;
        };
        self.usage_bytes -= entry.raw.len() as u64 + ENTRY_OVERHEAD_BYTES;
        self.revision += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn usage_bytes(&self) -> u64 {
        self.usage_bytes
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Ordered by txid.
    pub fn entries(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.entries.values()
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MempoolLoadStats {
    pub accepted: usize,
    pub failed: usize,
    pub already_known: usize,
}

pub fn load_mempool_file(path: &Path) -> Result<Vec<Vec<u8>>, String> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.to_string()),
    };

    let mut decoder = Decoder::new(&bytes);
    let version = decoder
        .read_u32_le()
        .map_err(|err| format!("invalid mempool file: {err}"))?;
    if version != MEMPOOL_FILE_VERSION {
        return Err(format!(
            "unsupported mempool file version {version} (expected {MEMPOOL_FILE_VERSION})"
        ));
    }
    let count = decoder
        .read_varint()
        .map_err(|err| format!("invalid mempool file: {err}"))?;
    let count = usize::try_from(count).map_err(|_| "mempool file count too large".to_string())?;
    let mut out = Vec::with_capacity(count.min(16_384));
    for _ in 0..count {
        let raw = decoder
            .read_var_bytes()
            .map_err(|err| format!("invalid mempool file: {err}"))?;
        out.push(raw);
    }
    if !decoder.is_empty() {
        return Err("invalid mempool file: trailing bytes".to_string());
    }
    Ok(out)
}

pub fn save_mempool_file(path: &Path, mempool: &Mempool) -> Result<usize, String> {
    let mut encoder = Encoder::new();
    encoder.write_u32_le(MEMPOOL_FILE_VERSION);
    encoder.write_varint(mempool.len() as u64);
    for entry in mempool.entries() {
        encoder.write_var_bytes(&entry.raw);
    }
    let bytes = encoder.into_inner();
    let len = bytes.len();
    crate::write_file_atomic(path, &bytes)?;
    Ok(len)
}

/// Feeds a snapshot back into `mempool`. Undecodable or unfitting entries are counted,
/// not fatal.
pub fn reload_mempool(path: &Path, mempool: &Mutex<Mempool>) -> Result<MempoolLoadStats, String> {
    let raws = load_mempool_file(path)?;
    let mut stats = MempoolLoadStats::default();
    let mut guard = mempool.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    for raw in raws {
        let tx = match Transaction::from_bytes(&raw) {
            Ok(tx) => tx,
            Err(err) => {
                log_debug!("dropping undecodable mempool entry: {err}");
                stats.failed += 1;
                continue;
            }
        };
        match guard.insert(&tx) {
            Ok(_) => stats.accepted += 1,
            Err(MempoolError::AlreadyKnown) => stats.already_known += 1,
            Err(MempoolError::Full) => stats.failed += 1,
        }
    }
    log_info!(
        "Imported mempool transactions from disk: {} successes, {} failed, {} already known",
        stats.accepted,
        stats.failed,
        stats.already_known
    );
    Ok(stats)
}

/// Rewrites the snapshot whenever the pool changed, until `interrupt` is raised.
pub fn persist_mempool_loop(
    mempool: Arc<Mutex<Mempool>>,
    path: PathBuf,
    interval: Duration,
    interrupt: InterruptToken,
) {
    if interval.is_zero() {
        return;
    }
    let mut last_revision = mempool
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .revision()
        .saturating_sub(1);
    let mut next_run = Instant::now() + interval;

    while !interrupt.is_interrupted() {
        std::thread::sleep(PERSIST_POLL_INTERVAL.min(interval));
        if Instant::now() < next_run {
            continue;
        }
        next_run = Instant::now() + interval;
        let guard = mempool.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let revision = guard.revision();
        if revision == last_revision {
            continue;
        }
        match save_mempool_file(&path, &guard) {
            Ok(bytes) => {
                log_debug!("Persisted mempool ({} txs, {bytes} bytes)", guard.len());
                last_revision = revision;
            }
            Err(err) => log_warn!("failed to persist {}: {err}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dualchain_chainstate::interrupt::interrupt_channel;
    use dualchain_primitives::{OutPoint, TxOut};

    fn spend(seed: u8, value: i64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![OutPoint::new([seed; 32], 0)],
            outputs: vec![TxOut {
                value,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn pool_respects_its_byte_budget() {
        let tx = spend(1, 10);
        let cost = dualchain_primitives::encoding::encode(&tx).len() as u64 + ENTRY_OVERHEAD_BYTES;
        let mut pool = Mempool::new(cost);
        pool.insert(&tx).expect("fits");
        assert_eq!(pool.insert(&tx), Err(MempoolError::AlreadyKnown));
        assert_eq!(pool.insert(&spend(2, 10)), Err(MempoolError::Full));
        assert!(pool.remove(&tx.txid()));
        assert_eq!(pool.usage_bytes(), 0);
        assert_eq!(pool.revision(), 2);
    }

    #[test]
    fn snapshot_reload_counts_each_outcome() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mempool.dat");
        let mut pool = Mempool::new(1 << 20);
        pool.insert(&spend(1, 10)).expect("insert");
        pool.insert(&spend(2, 20)).expect("insert");
        save_mempool_file(&path, &pool).expect("save");

        let target = Mutex::new(Mempool::new(1 << 20));
        target
            .lock()
            .expect("lock")
            .insert(&spend(1, 10))
            .expect("pre-existing");
        let stats = reload_mempool(&path, &target).expect("reload");
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.already_known, 1);
        assert_eq!(target.lock().expect("lock").len(), 2);
    }

    #[test]
    fn missing_snapshot_is_empty_and_bad_version_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mempool.dat");
        assert!(load_mempool_file(&path).expect("missing").is_empty());
        fs::write(&path, 7u32.to_le_bytes()).expect("write");
        assert!(load_mempool_file(&path)
            .unwrap_err()
            .contains("unsupported mempool file version"));
    }

    #[test]
    fn persist_loop_writes_after_a_change_and_stops_on_interrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mempool.dat");
        let pool = Arc::new(Mutex::new(Mempool::new(1 << 20)));
        pool.lock().expect("lock").insert(&spend(3, 5)).expect("insert");
        let (source, token) = interrupt_channel();
        let worker = {
            let pool = Arc::clone(&pool);
            let path = path.clone();
            std::thread::spawn(move || {
                persist_mempool_loop(pool, path, Duration::from_millis(20), token)
            })
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while !path.exists() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        source.interrupt();
        worker.join().expect("join");
        assert_eq!(load_mempool_file(&path).expect("load").len(), 1);
    }
}
