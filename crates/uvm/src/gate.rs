//! One-shot completion signal shared between an attach and its waiters.

use std::sync::Arc;
use tokio::sync::watch;
use uvm_core::Error;

pub(crate) type GateResult = std::result::Result<(), Arc<Error>>;

/// Resolving side. Consumed on resolve so a gate completes at most once.
#[derive(Debug)]
pub(crate) struct GateSender(watch::Sender<Option<GateResult>>);

/// Waiting side. Cheap to clone; every clone observes the same outcome.
#[derive(Debug, Clone)]
pub(crate) struct Gate(watch::Receiver<Option<GateResult>>);

pub(crate) fn gate() -> (GateSender, Gate) {
    let (tx, rx) = watch::channel(None);
    (GateSender(tx), Gate(rx))
}

impl GateSender {
    pub(crate) fn resolve(self, result: GateResult) {
        self.0.send_replace(Some(result));
    }
}

impl Gate {
    /// Returns the outcome published by the sender. A sender dropped without
    /// resolving reads as [`Error::Cancelled`].
    pub(crate) async fn wait(&mut self) -> GateResult {
        match self.0.wait_for(Option::is_some).await {
            Ok(value) => value.clone().unwrap_or_else(|| Err(Arc::new(Error::Cancelled))),
            Err(_) => Err(Arc::new(Error::Cancelled)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn waiters_observe_success() {
        let (tx, gate) = gate();
        let mut a = gate.clone();
        let mut b = gate;

        let waiter = tokio::spawn(async move { a.wait().await });
        tx.resolve(Ok(()));

        assert!(waiter.await.unwrap().is_ok());
        assert!(b.wait().await.is_ok());
    }

    #[tokio::test]
    async fn waiters_share_the_same_error() {
        let (tx, mut gate) = gate();
        let mut other = gate.clone();
        tx.resolve(Err(Arc::new(Error::Modify("boom".to_string()))));

        let first = gate.wait().await.unwrap_err();
        let second = other.wait().await.unwrap_err();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn dropped_sender_reads_as_cancelled() {
        let (tx, mut gate) = gate();
        drop(tx);
        let err = gate.wait().await.unwrap_err();
        assert!(matches!(*err, Error::Cancelled));
    }
}
