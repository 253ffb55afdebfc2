use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use walsync_core::Change;

/// Producer side of the bounded hand-off queue.
///
/// Sending blocks while the queue is full, which is the only backpressure
/// between the replication stream and the consumer.
#[derive(Debug, Clone)]
pub struct Publisher {
    tx: mpsc::Sender<Change>,
    cancel: CancellationToken,
}

impl Publisher {
    pub fn new(tx: mpsc::Sender<Change>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    /// Hand a change to the consumer.
    ///
    /// Returns `false` once a stop was requested or the consumer went away;
    /// the change was not delivered and the producer should wind down.
    pub async fn publish(&self, change: Change) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            result = self.tx.send(change) => result.is_ok(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves when a stop is requested.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

/// Requests a running engine to stop from another task.
#[derive(Debug, Clone)]
pub struct StopHandle(CancellationToken);

impl StopHandle {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self(token)
    }

    pub fn stop(&self) {
        self.0.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.0.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use walsync_core::{TableRef, Value};

    fn change(id: i64) -> Change {
        Change::snapshot_insert(
            TableRef::new("public", "orders"),
            [("id".to_string(), Value::Int(id))].into_iter().collect(),
        )
    }

    #[tokio::test]
    async fn test_publish_delivers_in_order() {
        let (tx, mut rx) = mpsc::channel(4);
        let publisher = Publisher::new(tx, CancellationToken::new());

        assert!(publisher.publish(change(1)).await);
        assert!(publisher.publish(change(2)).await);

        assert_eq!(rx.recv().await.unwrap().get("id"), Some(&Value::Int(1)));
        assert_eq!(rx.recv().await.unwrap().get("id"), Some(&Value::Int(2)));
    }

    #[tokio::test]
    async fn test_cancel_releases_blocked_send() {
        let (tx, _rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        let publisher = Publisher::new(tx, token.clone());

        assert!(publisher.publish(change(1)).await);

        let blocked = {
            let publisher = publisher.clone();
            tokio::spawn(async move { publisher.publish(change(2)).await })
        };
        StopHandle::new(token).stop();

        assert!(!blocked.await.unwrap());
        assert!(publisher.is_stopped());
    }

    #[tokio::test]
    async fn test_closed_receiver() {
        let (tx, rx) = mpsc::channel(1);
        let publisher = Publisher::new(tx, CancellationToken::new());
        drop(rx);

        assert!(!publisher.publish(change(1)).await);
        assert!(publisher.is_stopped());
    }
}
