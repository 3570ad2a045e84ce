//! Queued subscriber.
//!
//! Consumes a durable queue with a prefetch of one and hands each body to the
//! application over a [`rendezvous`](crate::bus::rendezvous) channel. A
//! delivery is acknowledged only once the application took it, and the next
//! delivery is not requested until then. Unacknowledged deliveries return to
//! the queue when the session dies.

use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::BrokerResult;
use crate::bus::HandoffSender;
use crate::session::SessionStream;
use crate::transport::Session;

/// Default pause before resubscribing after a setup failure
pub const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Consumes one queue across reconnects
#[derive(Debug, Clone)]
pub struct QueuedSubscriber {
    queue: String,
    prefetch: u16,
    resubscribe_delay: Duration,
}

enum Outcome {
    Closed,
    SessionLost,
}

impl QueuedSubscriber {
    /// Creates a subscriber for `queue`
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            prefetch: 1,
            resubscribe_delay: RESUBSCRIBE_DELAY,
        }
    }

    /// Overrides the pause between failed subscription attempts
    #[must_use]
    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    /// Runs until the session stream ends or the application closes its
    /// receiving end
    ///
    /// # Errors
    ///
    /// Returns the session factory's error when no session can be dialed.
    pub async fn run<S: Session>(
        self,
        mut sessions: SessionStream<S>,
        messages: HandoffSender,
    ) -> BrokerResult<()> {
        loop {
            let Some(session) = sessions.next().await? else {
                debug!(queue = %self.queue, "subscriber stopped");
                return Ok(());
            };

            match self.consume_on(&session, &messages).await {
                Ok(Outcome::Closed) => {
                    close(&session).await;
                    debug!(queue = %self.queue, "application stopped receiving");
                    return Ok(());
                }
                Ok(Outcome::SessionLost) => {
                    info!(queue = %self.queue, "subscriber session lost, resubscribing");
                }
                Err(err) => {
                    warn!(queue = %self.queue, error = %err, "cannot subscribe");
                    close(&session).await;
                    tokio::time::sleep(self.resubscribe_delay).await;
                }
            }
        }
    }

    async fn consume_on<S: Session>(
        &self,
        session: &S,
        messages: &HandoffSender,
    ) -> BrokerResult<Outcome> {
        session.declare_queue(&self.queue).await?;
        session.set_prefetch(self.prefetch).await?;
        let mut deliveries = session.consume(&self.queue).await?;
        info!(queue = %self.queue, "subscribed");

        loop {
            let delivery = tokio::select! {
                () = messages.closed() => return Ok(Outcome::Closed),
                delivery = deliveries.next() => delivery,
            };
            let Some(delivery) = delivery else {
                break;
            };
            if messages.send(delivery.body).await.is_err() {
                debug!(queue = %self.queue, "delivery not taken, leaving it unacked");
                return Ok(Outcome::Closed);
            }
            if let Err(err) = session.ack(delivery.delivery_tag).await {
                warn!(queue = %self.queue, error = %err, "ack failed");
                close(session).await;
                return Ok(Outcome::SessionLost);
            }
        }
        close(session).await;
        Ok(Outcome::SessionLost)
    }
}

async fn close<S: Session>(session: &S) {
    if let Err(err) = session.close().await {
        debug!(error = %err, "session close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBroker;
    use crate::bus::{self, HandoffReceiver};
    use crate::session::{DialPolicy, SessionFactory};
    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;

    const WAIT: Duration = Duration::from_secs(5);

    fn spawn_subscriber(
        broker: &MemoryBroker,
        cancel: &CancellationToken,
    ) -> (HandoffReceiver, tokio::task::JoinHandle<BrokerResult<()>>) {
        let sessions =
            SessionFactory::new(broker.connector(), DialPolicy::default()).spawn(cancel.clone());
        let (tx, rx) = bus::rendezvous();
        let handle = tokio::spawn(
            QueuedSubscriber::new("jobs")
                .with_resubscribe_delay(Duration::from_millis(5))
                .run(sessions, tx),
        );
        (rx, handle)
    }

    #[tokio::test]
    async fn test_one_delivery_in_flight() {
        let broker = MemoryBroker::new();
        for body in ["a", "b", "c"] {
            broker.enqueue("jobs", body.as_bytes().to_vec());
        }
        let cancel = CancellationToken::new();
        let (mut rx, _handle) = spawn_subscriber(&broker, &cancel);

        // "a" waits in the hand-off unacked until it is taken
        assert!(broker.wait_until(WAIT, |b| b.queue_len("jobs") == 2).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.queue_len("jobs"), 2);
        assert_eq!(broker.unacked(), 1);
        assert!(broker.acked().is_empty());

        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(rx.recv().await.unwrap());
        }
        assert_eq!(received, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert!(broker.wait_until(WAIT, |b| b.acked().len() == 3).await);
        assert_eq!(broker.max_unacked(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_resubscribes_after_disconnect() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        let (mut rx, _handle) = spawn_subscriber(&broker, &cancel);

        broker.enqueue("jobs", b"first".to_vec());
        assert_eq!(rx.recv().await.unwrap(), b"first".to_vec());
        assert!(broker.wait_until(WAIT, |b| b.acked().len() == 1).await);

        broker.disconnect();
        assert!(broker.wait_until(WAIT, |b| b.dials() == 2).await);

        broker.enqueue("jobs", b"second".to_vec());
        assert_eq!(rx.recv().await.unwrap(), b"second".to_vec());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_unacked_delivery_is_redelivered() {
        let broker = MemoryBroker::new();
        broker.enqueue("jobs", b"a".to_vec());
        broker.enqueue("jobs", b"b".to_vec());
        let cancel = CancellationToken::new();
        let (mut rx, _handle) = spawn_subscriber(&broker, &cancel);

        // "a" is taken and acked; "b" waits in the hand-off unacked
        assert_eq!(rx.recv().await.unwrap(), b"a".to_vec());
        assert!(broker.wait_until(WAIT, |b| b.acked().len() == 1 && b.unacked() == 1).await);
        broker.disconnect();

        let mut rest = Vec::new();
        while let Ok(Some(body)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
            rest.push(body);
        }
        assert!(rest.contains(&b"b".to_vec()));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_closed_receiver_stops_subscriber() {
        let broker = MemoryBroker::new();
        broker.enqueue("jobs", b"a".to_vec());
        let cancel = CancellationToken::new();
        let (rx, handle) = spawn_subscriber(&broker, &cancel);
        drop(rx);

        tokio::time::timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
        assert_eq!(broker.queue_len("jobs"), 1);
        assert!(broker.acked().is_empty());
    }

    #[tokio::test]
    async fn test_idle_subscriber_stops_when_receiver_closes() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        let (rx, handle) = spawn_subscriber(&broker, &cancel);
        assert!(broker.wait_until(WAIT, |b| b.live_sessions() == 1).await);

        drop(rx);
        tokio::time::timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
        assert!(broker.wait_until(WAIT, |b| b.live_sessions() == 0).await);
    }

    #[tokio::test]
    async fn test_cancel_stops_subscriber() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        let (_rx, handle) = spawn_subscriber(&broker, &cancel);
        assert!(broker.wait_until(WAIT, |b| b.live_sessions() == 1).await);

        cancel.cancel();
        broker.disconnect();
        tokio::time::timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
    }
}
