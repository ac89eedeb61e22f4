// kiln-core/src/cancel.rs
use std::sync::Arc;

use kiln_common::error::{KilnError, Result};
use kiln_common::pipeline::PipelineState;
use tokio::sync::watch;

/// Cooperative cancellation shared by every pipeline task. Checked at phase
/// boundaries only, so a write in progress always completes.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives in `self`, so `wait_for` cannot observe a closed channel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// `Cancelled` when the signal has fired before `next` is entered.
    pub fn check(&self, next: PipelineState) -> Result<()> {
        if self.is_cancelled() {
            Err(KilnError::Cancelled(next.to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}
