//! Reliable publisher.
//!
//! Publishes messages from an inbound channel to a fanout exchange, one at a
//! time. A message is read from the channel only after the previous one was
//! confirmed by the broker, so the single-slot channel in front of the
//! publisher acts as back-pressure for the producer.
//!
//! A message whose publish fails, or whose session is lost before the broker
//! confirms it, stays in the pending slot and is published again on the next
//! session. A negative confirmation is logged and the message is dropped.
//! A session that cannot declare the exchange is closed like a lost one, and
//! every reconnect waits for the reconnect delay first.

use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::BrokerResult;
use crate::session::SessionStream;
use crate::transport::{ConfirmStream, Confirmation, Message, Session};

/// Default pause before dialing again after a lost session
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Publishes to one exchange across reconnects
#[derive(Debug)]
pub struct ReliablePublisher {
    exchange: String,
    pending: Option<Message>,
    reconnect_delay: Duration,
}

enum Outcome {
    Drained,
    SessionLost,
}

impl ReliablePublisher {
    /// Creates a publisher for `exchange`
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            pending: None,
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    /// Overrides the pause between a lost session and the next dial
    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Runs until the inbound channel is closed and drained, or the session
    /// stream ends
    ///
    /// # Errors
    ///
    /// Returns the session factory's error when no session can be dialed.
    pub async fn run<S: Session>(
        mut self,
        mut sessions: SessionStream<S>,
        mut messages: mpsc::Receiver<Message>,
    ) -> BrokerResult<()> {
        loop {
            let Some(session) = sessions.next().await? else {
                if let Some(message) = self.pending.take() {
                    warn!(
                        exchange = %self.exchange,
                        bytes = message.len(),
                        "publisher stopped with an unpublished message"
                    );
                }
                debug!(exchange = %self.exchange, "publisher stopped");
                return Ok(());
            };

            match self.publish_on(session, &mut messages).await {
                Outcome::Drained => {
                    debug!(exchange = %self.exchange, "publisher drained");
                    return Ok(());
                }
                Outcome::SessionLost => {
                    info!(exchange = %self.exchange, "publisher session lost, reconnecting");
                    tokio::time::sleep(self.reconnect_delay).await;
                }
            }
        }
    }

    async fn publish_on<S: Session>(
        &mut self,
        mut session: S,
        messages: &mut mpsc::Receiver<Message>,
    ) -> Outcome {
        if let Err(err) = session.declare_exchange(&self.exchange).await {
            warn!(exchange = %self.exchange, error = %err, "cannot declare exchange");
            close(&session).await;
            return Outcome::SessionLost;
        }

        let mut confirms = match session.enable_confirms().await {
            Ok(confirms) => Some(confirms),
            Err(err) => {
                warn!(exchange = %self.exchange, error = %err, "publishing without confirmations");
                None
            }
        };

        let mut in_flight: Option<Message> = None;
        loop {
            if in_flight.is_none()
                && let Some(message) = self.pending.take()
            {
                if let Err(err) = session.publish(&self.exchange, &message).await {
                    warn!(exchange = %self.exchange, error = %err, "publish failed");
                    self.pending = Some(message);
                    close(&session).await;
                    return Outcome::SessionLost;
                }
                if confirms.is_some() {
                    in_flight = Some(message);
                } else {
                    warn!(exchange = %self.exchange, "published without confirmation");
                }
            }

            let idle = in_flight.is_none() && self.pending.is_none();
            tokio::select! {
                confirmation = next_confirmation(&mut confirms), if in_flight.is_some() => {
                    match confirmation {
                        Some(Confirmation { ack: true, delivery_tag }) => {
                            debug!(exchange = %self.exchange, delivery_tag, "publish confirmed");
                        }
                        Some(Confirmation { ack: false, delivery_tag }) => {
                            warn!(exchange = %self.exchange, delivery_tag, "publish negatively confirmed");
                        }
                        None => {
                            self.pending = in_flight.take();
                            close(&session).await;
                            return Outcome::SessionLost;
                        }
                    }
                    in_flight = None;
                }
                message = messages.recv(), if idle => match message {
                    Some(message) => self.pending = Some(message),
                    None => {
                        close(&session).await;
                        return Outcome::Drained;
                    }
                },
            }
        }
    }
}

async fn next_confirmation(confirms: &mut Option<ConfirmStream>) -> Option<Confirmation> {
    match confirms {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn close<S: Session>(session: &S) {
    if let Err(err) = session.close().await {
        debug!(error = %err, "session close failed");
    }
}
