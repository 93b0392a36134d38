use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use tracing::trace;

use crate::error::NegotiationError;

type Slot<T> = Arc<Mutex<Option<oneshot::Sender<Result<T, String>>>>>;

/// Callback half of a single-shot engine operation.
pub struct Completion<T> {
    op: &'static str,
    slot: Slot<T>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            op: self.op,
            slot: self.slot.clone(),
        }
    }
}

impl<T> Completion<T> {
    /// Returns `false` if the operation was already resolved.
    pub fn complete(&self, result: Result<T, String>) -> bool {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(sender) = sender else {
            trace!("{} resolved more than once, ignored", self.op);
            return false;
        };
        // The waiting side may already be gone after a cancellation.
        let _ = sender.send(result);
        true
    }

    pub fn succeed(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.complete(Err(reason.into()))
    }
}

/// Awaiting half of a single-shot engine operation.
pub struct Pending<T> {
    op: &'static str,
    rx: oneshot::Receiver<Result<T, String>>,
}

impl<T> Pending<T> {
    /// Resolves with `Cancelled` when every [`Completion`] was dropped unresolved.
    pub async fn wait(self) -> Result<T, NegotiationError> {
        match self.rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(reason)) => Err(NegotiationError::Rejected {
                op: self.op,
                reason,
            }),
            Err(_) => Err(NegotiationError::Cancelled(self.op)),
        }
    }
}

pub fn single_shot<T>(op: &'static str) -> (Completion<T>, Pending<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Completion {
            op,
            slot: Arc::new(Mutex::new(Some(tx))),
        },
        Pending { op, rx },
    )
}
