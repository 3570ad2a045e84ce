//! Session factory.
//!
//! A single background task owns the [`Connector`] and dials a fresh session
//! each time a consumer asks for one. Consumers hold a [`SessionStream`] and
//! call [`SessionStream::next`] whenever their current session is gone. The
//! stream ends when the factory is cancelled; a dial that fails past the
//! retry policy is reported to the requester as a fatal error.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::BrokerResult;
use crate::transport::{Connector, Session};

type Request<S> = oneshot::Sender<BrokerResult<S>>;

/// Dial retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialPolicy {
    /// Total dial attempts per request; the last failure is fatal
    pub attempts: u32,
    /// Pause between failed attempts
    pub retry_delay: Duration,
}

impl Default for DialPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Produces sessions on demand from a connector
#[derive(Debug)]
pub struct SessionFactory<C> {
    connector: C,
    policy: DialPolicy,
}

impl<C: Connector> SessionFactory<C> {
    /// Creates a factory
    pub fn new(connector: C, policy: DialPolicy) -> Self {
        Self { connector, policy }
    }

    /// Starts the factory task and returns the stream of sessions
    ///
    /// The task stops when `cancel` fires or when the stream is dropped.
    pub fn spawn(self, cancel: CancellationToken) -> SessionStream<C::Session> {
        let (requests, inbox) = mpsc::channel(1);
        let task = tokio::spawn(self.serve(inbox, cancel));
        SessionStream { requests, task }
    }

    async fn serve(self, mut inbox: mpsc::Receiver<Request<C::Session>>, cancel: CancellationToken) {
        let target = self.connector.target();
        loop {
            let reply = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                request = inbox.recv() => match request {
                    Some(reply) => reply,
                    None => break,
                },
            };

            let dialed = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                dialed = self.dial() => dialed,
            };
            let fatal = dialed.is_err();

            if let Err(Ok(session)) = reply.send(dialed) {
                debug!(target = %target, "session requester went away, closing session");
                if let Err(err) = session.close().await {
                    debug!(error = %err, "close after abandoned dial failed");
                }
            }
            if fatal {
                break;
            }
        }
        debug!(target = %target, "session factory stopped");
    }

    async fn dial(&self) -> BrokerResult<C::Session> {
        let target = self.connector.target();
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.connector.dial().await {
                Ok(session) => {
                    info!(target = %target, "connected to broker");
                    return Ok(session);
                }
                Err(err) if attempt < attempts => {
                    warn!(
                        target = %target,
                        attempt,
                        error = %err,
                        "dial failed, retrying in {:?}",
                        self.policy.retry_delay
                    );
                    tokio::time::sleep(self.policy.retry_delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    error!(target = %target, attempt, error = %err, "dial failed");
                    return Err(err);
                }
            }
        }
    }
}

/// Consumer end of a [`SessionFactory`]
#[derive(Debug)]
pub struct SessionStream<S> {
    requests: mpsc::Sender<Request<S>>,
    task: JoinHandle<()>,
}

impl<S: Session> SessionStream<S> {
    /// Waits for a fresh session
    ///
    /// Returns `Ok(None)` once the factory is cancelled, and an error when
    /// the broker could not be reached.
    ///
    /// # Errors
    ///
    /// Returns the dial error that exhausted the [`DialPolicy`].
    pub async fn next(&mut self) -> BrokerResult<Option<S>> {
        let (reply, response) = oneshot::channel();
        if self.requests.send(reply).await.is_err() {
            return Ok(None);
        }
        match response.await {
            Ok(Ok(session)) => Ok(Some(session)),
            Ok(Err(err)) => Err(err),
            Err(_) => Ok(None),
        }
    }
}

impl<S> Drop for SessionStream<S> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBroker;

    #[tokio::test]
    async fn test_each_request_dials_once() {
        let broker = MemoryBroker::new();
        let mut sessions =
            SessionFactory::new(broker.connector(), DialPolicy::default()).spawn(CancellationToken::new());

        let first = sessions.next().await.unwrap().unwrap();
        let second = sessions.next().await.unwrap().unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(broker.dials(), 2);
    }

    #[tokio::test]
    async fn test_cancel_ends_stream() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        let mut sessions = SessionFactory::new(broker.connector(), DialPolicy::default())
            .spawn(cancel.clone());

        cancel.cancel();
        assert!(sessions.next().await.unwrap().is_none());
        assert!(sessions.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dial_failure_is_fatal() {
        let broker = MemoryBroker::new();
        broker.fail_dials(true);
        let mut sessions =
            SessionFactory::new(broker.connector(), DialPolicy::default()).spawn(CancellationToken::new());

        let err = sessions.next().await.unwrap_err();
        assert!(err.to_string().contains("cannot (re)dial memory://"));
        assert!(sessions.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dial_retries_within_policy() {
        let broker = MemoryBroker::new();
        broker.fail_dials(true);
        let policy = DialPolicy {
            attempts: 50,
            retry_delay: Duration::from_millis(5),
        };
        let mut sessions = SessionFactory::new(broker.connector(), policy).spawn(CancellationToken::new());

        let healer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            healer.fail_dials(false);
        });

        assert!(sessions.next().await.unwrap().is_some());
        assert_eq!(broker.dials(), 1);
    }
}
