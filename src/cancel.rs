//! Cooperative cancellation for foreground workflows.
//!
//! A [`CancelHandle`] is held by the caller; the matching [`CancelSignal`]
//! is threaded through every stage and `select!`-ed against external
//! calls. Cancellation is edge-triggered and sticky: once fired it stays
//! fired.

use tokio::sync::watch;

use crate::error::CoreError;

/// Caller-side handle that can cancel a workflow.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Fire the cancellation. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Workflow-side signal checked at suspension points.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Create a connected handle/signal pair.
    pub fn new() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelSignal { rx })
    }

    /// A signal that can never fire, for callers without cancellation.
    pub fn never() -> CancelSignal {
        let (_tx, rx) = watch::channel(false);
        // The sender is dropped; `changed()` resolves to Err and
        // `cancelled()` stays false forever.
        CancelSignal { rx }
    }

    /// Whether cancellation has fired.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation fires; pends forever on a [`Self::never`]
    /// signal.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without cancelling: pend forever.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Bail out with `Transient("cancelled")` if cancellation has fired.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transient`] when cancelled.
    pub fn check(&self) -> Result<(), CoreError> {
        if self.is_cancelled() {
            return Err(CoreError::Transient("cancelled".to_owned()));
        }
        Ok(())
    }
}
