//! Read-side containment for the persistent coin views.
//!
//! A lookup either yields a coin, yields "absent", or never returns. Storage faults are
//! handed to a [`FatalReadHandler`] instead of being folded into "absent".

use std::fmt;

use dualchain_log::log_error;
use dualchain_primitives::{hash_to_hex, Hash256, OutPoint};
use dualchain_storage::StoreError;

use crate::coins::{Coin, CoinsView, ViewKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultSeverity {
    /// The process cannot continue with this store.
    Fatal,
}

#[derive(Debug)]
pub struct ReadFault {
    pub view: ViewKind,
    pub operation: &'static str,
    pub outpoint: Option<OutPoint>,
    pub error: StoreError,
}

impl ReadFault {
    pub fn severity(&self) -> FaultSeverity {
        FaultSeverity::Fatal
    }
}

impl fmt::Display for ReadFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "error reading from {} database during {}",
            self.view.as_str(),
            self.operation
        )?;
        if let Some(outpoint) = &self.outpoint {
            write!(f, " of {}:{}", hash_to_hex(&outpoint.hash), outpoint.index)?;
        }
        write!(f, ": {}", self.error)
    }
}

pub type FatalReadHandler = fn(&ReadFault) -> !;

/// Logs the fault and aborts. Unwinding past a half-read chain state is not an option.
pub fn abort_on_read_fault(fault: &ReadFault) -> ! {
    log_error!("{fault}");
    log_error!(
        "Error reading from database, shutting down. Restart with --reindex-chainstate if the problem persists."
    );
    dualchain_log::close_file();
    std::process::abort()
}

pub struct ErrorCatchingView<V> {
    inner: V,
    view: ViewKind,
    on_fatal: FatalReadHandler,
}

impl<V: CoinsView> ErrorCatchingView<V> {
    pub fn new(inner: V, view: ViewKind, on_fatal: FatalReadHandler) -> Self {
        Self {
            inner,
            view,
            on_fatal,
        }
    }

    pub fn view(&self) -> ViewKind {
        self.view
    }

    /// Write paths go to the wrapped view directly and see ordinary errors.
    pub fn inner(&self) -> &V {
        &self.inner
    }

    pub fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        match self.inner.get_coin(outpoint) {
            Ok(coin) => coin,
            Err(error) => self.fail("get_coin", Some(*outpoint), error),
        }
    }

    pub fn have_coin(&self, outpoint: &OutPoint) -> bool {
        match self.inner.have_coin(outpoint) {
            Ok(found) => found,
            Err(error) => self.fail("have_coin", Some(*outpoint), error),
        }
    }

    pub fn best_block(&self) -> Option<Hash256> {
        match self.inner.best_block() {
            Ok(hash) => hash,
            Err(error) => self.fail("best_block", None, error),
        }
    }

    fn fail(&self, operation: &'static str, outpoint: Option<OutPoint>, error: StoreError) -> ! {
        let fault = ReadFault {
            view: self.view,
            operation,
            outpoint,
            error,
        };
        (self.on_fatal)(&fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FaultyView;

    impl CoinsView for FaultyView {
        fn get_coin(&self, _outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
            Err(StoreError::Backend("disk on fire".to_string()))
        }

        fn best_block(&self) -> Result<Option<Hash256>, StoreError> {
            Ok(None)
        }
    }

    struct EmptyView;

    impl CoinsView for EmptyView {
        fn get_coin(&self, _outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
            Ok(None)
        }

        fn best_block(&self) -> Result<Option<Hash256>, StoreError> {
            Ok(None)
        }
    }

    fn panic_on_fault(fault: &ReadFault) -> ! {
        assert_eq!(fault.severity(), FaultSeverity::Fatal);
        panic!("fatal read fault: {fault}")
    }

    #[test]
    fn absent_key_is_not_a_fault() {
        let view = ErrorCatchingView::new(EmptyView, ViewKind::Main, panic_on_fault);
        assert_eq!(view.get_coin(&OutPoint::new([1u8; 32], 0)), None);
        assert!(!view.have_coin(&OutPoint::new([1u8; 32], 0)));
    }

    #[test]
    #[should_panic(expected = "fatal read fault")]
    fn backend_error_never_reads_as_absent() {
        let view = ErrorCatchingView::new(FaultyView, ViewKind::Witness, panic_on_fault);
        let _ = view.get_coin(&OutPoint::new([1u8; 32], 0));
    }

    #[test]
    fn fault_message_names_view_and_outpoint() {
        let fault = ReadFault {
            view: ViewKind::Witness,
            operation: "get_coin",
            outpoint: Some(OutPoint::new([0u8; 32], 3)),
            error: StoreError::Backend("io".to_string()),
        };
        let text = fault.to_string();
        assert!(text.contains("witness chainstate"));
        assert!(text.contains(":3"));
    }
}
