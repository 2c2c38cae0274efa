//! In-memory coin cache layered over a contained persistent view.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use dualchain_log::log_debug;
use dualchain_primitives::{Hash256, OutPoint};
use dualchain_storage::StoreError;

use crate::catcher::ErrorCatchingView;
use crate::coins::{Coin, CoinsViewDb, ViewKind};

#[derive(Clone, Debug)]
struct CacheEntry {
    /// `None` is a spend that still has to reach disk.
    coin: Option<Coin>,
    dirty: bool,
    /// Never written to disk, so a spend can simply forget it.
    fresh: bool,
}

impl CacheEntry {
    fn usage(&self) -> usize {
        std::mem::size_of::<OutPoint>()
            + std::mem::size_of::<Self>()
            + self.coin.as_ref().map(|coin| coin.script_pubkey.capacity()).unwrap_or(0)
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<OutPoint, CacheEntry>,
    best_block: Option<Option<Hash256>>,
    best_dirty: bool,
    usage: usize,
}

impl CacheState {
    fn insert(&mut self, outpoint: OutPoint, entry: CacheEntry) {
        self.usage += entry.usage();
        if let Some(previous) = self.entries.insert(outpoint, entry) {
            self.usage = self.usage.saturating_sub(previous.usage());
        }
    }

    fn remove(&mut self, outpoint: &OutPoint) -> Option<CacheEntry> {
        let removed = self.entries.remove(outpoint)?;
        self.usage = self.usage.saturating_sub(removed.usage());
        Some(removed)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlushStats {
    pub coins_written: usize,
    pub wrote_best_block: bool,
}

pub struct CoinsTip {
    base: ErrorCatchingView<CoinsViewDb>,
    budget_bytes: usize,
    state: Mutex<CacheState>,
}

impl CoinsTip {
    pub fn new(base: ErrorCatchingView<CoinsViewDb>, budget_bytes: usize) -> Self {
        Self {
            base,
            budget_bytes,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn view_kind(&self) -> ViewKind {
        self.base.view()
    }

    pub fn db(&self) -> &CoinsViewDb {
        self.base.inner()
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    pub fn dynamic_usage(&self) -> usize {
        self.lock().usage
    }

    pub fn cached_entries(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        let mut state = self.lock();
        if let Some(entry) = state.entries.get(outpoint) {
            return entry.coin.clone();
        }
        let coin = self.base.get_coin(outpoint)?;
        state.insert(
            *outpoint,
            CacheEntry {
                coin: Some(coin.clone()),
                dirty: false,
                fresh: false,
            },
        );
        Some(coin)
    }

    pub fn have_coin(&self, outpoint: &OutPoint) -> bool {
        {
            let state = self.lock();
            if let Some(entry) = state.entries.get(outpoint) {
                return entry.coin.is_some();
            }
        }
        self.base.have_coin(outpoint)
    }

    /// `possible_overwrite` is false for outputs created by a block being connected, which
    /// cannot exist on disk yet.
    pub fn add_coin(&self, outpoint: OutPoint, coin: Coin, possible_overwrite: bool) {
        let mut state = self.lock();
        let fresh = match state.entries.get(&outpoint) {
            Some(existing) => existing.fresh,
            None => !possible_overwrite,
        };
        state.insert(
            outpoint,
            CacheEntry {
                coin: Some(coin),
                dirty: true,
                fresh,
            },
        );
    }

    pub fn spend_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        let mut state = self.lock();
        let entry = match state.entries.get(outpoint).cloned() {
            Some(entry) => entry,
            None => {
                let coin = self.base.get_coin(outpoint)?;
                CacheEntry {
                    coin: Some(coin),
                    dirty: false,
                    fresh: false,
                }
            }
        };
        let coin = entry.coin?;
        if entry.fresh {
            state.remove(outpoint);
        } else {
            state.insert(
                *outpoint,
                CacheEntry {
                    coin: None,
                    dirty: true,
                    fresh: false,
                },
            );
        }
        Some(coin)
    }

    pub fn best_block(&self) -> Option<Hash256> {
        let mut state = self.lock();
        if let Some(best) = state.best_block {
            return best;
        }
        let best = self.base.best_block();
        state.best_block = Some(best);
        best
    }

    pub fn set_best_block(&self, hash: Option<Hash256>) {
        let mut state = self.lock();
        state.best_block = Some(hash);
        state.best_dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        let state = self.lock();
        state.best_dirty || state.entries.values().any(|entry| entry.dirty)
    }

    /// Writes every dirty entry in one batch and empties the cache.
    pub fn flush(&self) -> Result<FlushStats, StoreError> {
        let mut state = self.lock();
        let dirty: Vec<(&OutPoint, Option<&Coin>)> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.dirty && !(entry.fresh && entry.coin.is_none()))
            .map(|(outpoint, entry)| (outpoint, entry.coin.as_ref()))
            .collect();
        if dirty.is_empty() && !state.best_dirty {
            state.entries.clear();
            state.usage = 0;
            return Ok(FlushStats::default());
        }
        let best = match state.best_block {
            Some(best) => best,
            None => self.base.best_block(),
        };
        let coins_written = self.base.inner().write_coins(dirty, best)?;
        let wrote_best_block = state.best_dirty;
        log_debug!(
            "Flushed {} coins to {} database",
            coins_written,
            self.view_kind().as_str()
        );
        state.entries.clear();
        state.usage = 0;
        state.best_dirty = false;
        Ok(FlushStats {
            coins_written,
            wrote_best_block,
        })
    }

    /// Makes the last flush durable.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.base.inner().flush()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catcher::abort_on_read_fault;
    use crate::coins::CoinsView;
    use dualchain_storage::memory::MemoryStore;
    use dualchain_storage::KeyValueStore;
    use std::sync::Arc;

    fn tip() -> (Arc<dyn KeyValueStore>, CoinsTip) {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let db = CoinsViewDb::open(Arc::clone(&store), ViewKind::Main).expect("open");
        let view = ErrorCatchingView::new(db, ViewKind::Main, abort_on_read_fault);
        (store, CoinsTip::new(view, 1 << 20))
    }

    fn coin(value: i64) -> Coin {
        Coin {
            value,
            script_pubkey: vec![0x51],
            height: 1,
            flags: 0,
        }
    }

    #[test]
    fn fresh_coin_spent_before_flush_never_hits_disk() {
        let (store, tip) = tip();
        let outpoint = OutPoint::new([1u8; 32], 0);
        tip.add_coin(outpoint, coin(5), false);
        assert_eq!(tip.spend_coin(&outpoint), Some(coin(5)));
        assert_eq!(tip.cached_entries(), 0);
        tip.flush().expect("flush");
        let db = CoinsViewDb::open(store, ViewKind::Main).expect("reopen");
        assert_eq!(db.get_coin(&outpoint).expect("get"), None);
    }

    #[test]
    fn flush_persists_adds_spends_and_best_block() {
        let (store, tip) = tip();
        let kept = OutPoint::new([2u8; 32], 0);
        let spent = OutPoint::new([3u8; 32], 0);
        tip.add_coin(kept, coin(1), false);
        tip.add_coin(spent, coin(2), false);
        tip.set_best_block(Some([7u8; 32]));
        let stats = tip.flush().expect("flush");
        assert_eq!(stats.coins_written, 2);
        assert!(stats.wrote_best_block);
        assert_eq!(tip.dynamic_usage(), 0);

        assert_eq!(tip.spend_coin(&spent), Some(coin(2)));
        tip.flush().expect("flush");

        let db = CoinsViewDb::open(store, ViewKind::Main).expect("reopen");
        assert_eq!(db.get_coin(&kept).expect("get"), Some(coin(1)));
        assert_eq!(db.get_coin(&spent).expect("get"), None);
        assert_eq!(db.best_block().expect("best"), Some([7u8; 32]));
    }

    #[test]
    fn dirty_until_flushed() {
        let (_store, tip) = tip();
        assert!(!tip.is_dirty());
        tip.set_best_block(Some([9u8; 32]));
        assert!(tip.is_dirty());
        tip.flush().expect("flush");
        assert!(!tip.is_dirty());

        let outpoint = OutPoint::new([5u8; 32], 1);
        tip.add_coin(outpoint, coin(3), false);
        assert!(tip.is_dirty());
        tip.flush().expect("flush");
        assert!(!tip.is_dirty());
        assert_eq!(tip.get_coin(&outpoint), Some(coin(3)));
        assert!(!tip.is_dirty(), "a read-through entry is clean");
    }

    #[test]
    fn usage_tracks_inserts_and_flushes() {
        let (_store, tip) = tip();
        assert_eq!(tip.dynamic_usage(), 0);
        tip.add_coin(OutPoint::new([4u8; 32], 0), coin(1), false);
        assert!(tip.dynamic_usage() > 0);
        tip.flush().expect("flush");
        assert_eq!(tip.dynamic_usage(), 0);
    }
}
