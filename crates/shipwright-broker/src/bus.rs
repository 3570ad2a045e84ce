//! Channels between the broker loops and the application.

use tokio::sync::{mpsc, oneshot};

use crate::transport::Message;

/// Creates a channel holding at most one message
///
/// Senders wait until the previous message was taken, which gives the
/// publisher loops their one-at-a-time hand-off.
#[must_use]
pub fn single_slot() -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
    mpsc::channel(1)
}

/// Creates a channel whose sends complete only once the receiver took the
/// message
///
/// A message still waiting when the receiver is dropped counts as not
/// delivered, so the subscriber leaves it unacknowledged.
#[must_use]
pub fn rendezvous() -> (HandoffSender, HandoffReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (HandoffSender { inner: tx }, HandoffReceiver { inner: rx })
}

struct Handoff {
    body: Message,
    taken: oneshot::Sender<()>,
}

/// Sending half of [`rendezvous`]
#[derive(Debug, Clone)]
pub struct HandoffSender {
    inner: mpsc::Sender<Handoff>,
}

/// The receiver went away before taking the message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotTaken;

impl HandoffSender {
    /// Sends `body` and waits until the receiver took it
    ///
    /// # Errors
    ///
    /// Returns [`NotTaken`] when the receiver is dropped first.
    pub async fn send(&self, body: Message) -> Result<(), NotTaken> {
        let (taken, confirmed) = oneshot::channel();
        self.inner
            .send(Handoff { body, taken })
            .await
            .map_err(|_| NotTaken)?;
        confirmed.await.map_err(|_| NotTaken)
    }

    /// Completes once the receiver is dropped
    pub async fn closed(&self) {
        self.inner.closed().await;
    }
}

impl std::fmt::Debug for Handoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handoff")
            .field("bytes", &self.body.len())
            .finish_non_exhaustive()
    }
}

/// Receiving half of [`rendezvous`]
#[derive(Debug)]
pub struct HandoffReceiver {
    inner: mpsc::Receiver<Handoff>,
}

impl HandoffReceiver {
    /// Takes the next message and releases its sender
    ///
    /// Returns `None` once every sender is gone. Cancel safe.
    pub async fn recv(&mut self) -> Option<Message> {
        let Handoff { body, taken } = self.inner.recv().await?;
        let _ = taken.send(());
        Some(body)
    }
}
