//! The main chain-state view together with its non-owning witness sibling.

use std::sync::{Arc, Weak};

use crate::cache::CoinsTip;
use crate::coins::COINS_SCHEMA_VERSION;
use crate::ChainStateError;

pub struct ChainStateHandle {
    main: CoinsTip,
    witness: Weak<CoinsTip>,
    stored_version: u32,
    current_version: u32,
}

impl ChainStateHandle {
    pub(crate) fn new(main: CoinsTip) -> Self {
        let stored_version = main.db().stored_version();
        Self {
            main,
            witness: Weak::new(),
            stored_version,
            current_version: COINS_SCHEMA_VERSION,
        }
    }

    pub(crate) fn link_sibling(&mut self, witness: &Arc<CoinsTip>) {
        self.witness = Arc::downgrade(witness);
    }

    pub fn main(&self) -> &CoinsTip {
        &self.main
    }

    /// `None` once the owner released the witness view.
    pub fn witness(&self) -> Option<Arc<CoinsTip>> {
        self.witness.upgrade()
    }

    /// Fails unless the witness view is still alive.
    pub fn require_witness(&self) -> Result<Arc<CoinsTip>, ChainStateError> {
        self.witness().ok_or(ChainStateError::MissingSibling)
    }

    /// Schema version found on disk when the view was opened.
    pub fn stored_version(&self) -> u32 {
        self.stored_version
    }

    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    pub fn needs_upgrade(&self) -> bool {
        self.main.db().stored_version() < self.current_version
    }
}

impl std::fmt::Debug for ChainStateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainStateHandle")
            .field("stored_version", &self.stored_version)
            .field("current_version", &self.current_version)
            .field("has_witness", &(self.witness.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catcher::{abort_on_read_fault, ErrorCatchingView};
    use crate::coins::{CoinsViewDb, ViewKind};
    use dualchain_storage::memory::MemoryStore;

    fn tip(kind: ViewKind) -> CoinsTip {
        let db = CoinsViewDb::open(Arc::new(MemoryStore::new()), kind).expect("open");
        CoinsTip::new(ErrorCatchingView::new(db, kind, abort_on_read_fault), 1024)
    }

    #[test]
    fn sibling_does_not_keep_witness_alive() {
        let mut handle = ChainStateHandle::new(tip(ViewKind::Main));
        assert!(matches!(
            handle.require_witness(),
            Err(ChainStateError::MissingSibling)
        ));

        let witness = Arc::new(tip(ViewKind::Witness));
        handle.link_sibling(&witness);
        assert_eq!(
            handle.require_witness().expect("witness").view_kind(),
            ViewKind::Witness
        );

        drop(witness);
        assert!(handle.witness().is_none());
    }

    #[test]
    fn fresh_view_reports_current_version() {
        let handle = ChainStateHandle::new(tip(ViewKind::Main));
        assert_eq!(handle.stored_version(), handle.current_version());
        assert!(!handle.needs_upgrade());
    }
}
