//! Cooperative interruption for long-running workers.

use std::sync::Arc;

use tokio::sync::watch;

/// Owning side. Raising it is permanent for every token ever handed out.
#[derive(Clone)]
pub struct InterruptSource {
    tx: Arc<watch::Sender<bool>>,
}

#[derive(Clone)]
pub struct InterruptToken {
    rx: watch::Receiver<bool>,
}

pub fn interrupt_channel() -> (InterruptSource, InterruptToken) {
    let (tx, rx) = watch::channel(false);
    (InterruptSource { tx: Arc::new(tx) }, InterruptToken { rx })
}

impl InterruptSource {
    pub fn interrupt(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_interrupted(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn token(&self) -> InterruptToken {
        InterruptToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl InterruptToken {
    /// A token that is never raised.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_interrupted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the source is raised. Pends forever if the source is gone.
    pub async fn interrupted(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl std::fmt::Debug for InterruptToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptToken")
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}
