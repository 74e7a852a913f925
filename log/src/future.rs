//! Per-message delivery outcome reporting.
//!
//! Every produce hands back a [`DeliveryFuture`]; the send path keeps the
//! matching [`DeliveryPromise`] inside the message envelope and resolves it
//! exactly once when the flush carrying the message settles. The promise is
//! consumed by `delivered`/`failed`, so double completion is impossible by
//! construction.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::{Error, Result};

type DeliveryResult = std::result::Result<(), Arc<Error>>;

/// The consumer side of a message's delivery outcome.
#[derive(Debug)]
pub struct DeliveryFuture {
    rx: oneshot::Receiver<DeliveryResult>,
}

impl DeliveryFuture {
    /// Waits for the message to be flushed.
    ///
    /// Resolves `Ok(())` once the message was written to the backend, or an
    /// error if the flush failed ([`Error::DeliveryFailed`] with the shared
    /// cause) or the log shut down with the message still queued
    /// ([`Error::DeliveryAbandoned`]).
    pub async fn wait(self) -> Result<()> {
        match self.rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(cause)) => Err(Error::DeliveryFailed(cause)),
            Err(_) => Err(Error::DeliveryAbandoned),
        }
    }
}

/// The producer side: completed exactly once by the flush path.
#[derive(Debug)]
pub(crate) struct DeliveryPromise {
    tx: oneshot::Sender<DeliveryResult>,
}

impl DeliveryPromise {
    pub(crate) fn delivered(self) {
        let _ = self.tx.send(Ok(()));
    }

    pub(crate) fn failed(self, cause: Arc<Error>) {
        let _ = self.tx.send(Err(cause));
    }
}

pub(crate) fn delivery() -> (DeliveryPromise, DeliveryFuture) {
    let (tx, rx) = oneshot::channel();
    (DeliveryPromise { tx }, DeliveryFuture { rx })
}
