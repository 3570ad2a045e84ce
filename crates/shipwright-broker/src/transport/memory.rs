//! In-memory transport with failure injection.
//!
//! `MemoryBroker` keeps fanout exchanges as append-only logs and queues as
//! FIFOs. Deliveries respect each session's prefetch limit and unacknowledged
//! deliveries return to the head of their queue when a session dies, which is
//! what a real broker does on connection loss.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{
    ConfirmStream, Confirmation, Connector, Delivery, DeliveryStream, Message, Session,
    unbounded_stream,
};
use crate::{BrokerError, BrokerErrorKind, BrokerResult};

/// A publish as seen by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAttempt {
    /// Session the publish was issued on
    pub session: u64,
    /// Target exchange
    pub exchange: String,
    /// Message body
    pub body: Message,
    /// False when the attempt failed in transit
    pub delivered: bool,
}

#[derive(Debug, Default)]
struct State {
    exchanges: HashMap<String, Vec<Message>>,
    declared_exchanges: HashSet<String>,
    queues: HashMap<String, VecDeque<Message>>,
    sessions: BTreeMap<u64, SessionState>,
    next_session: u64,
    next_tag: u64,
    dials: usize,
    fail_dials: bool,
    fail_publishes: usize,
    fail_declares: usize,
    nack_publishes: usize,
    confirms_unsupported: bool,
    hold_confirms: bool,
    held: Vec<(u64, Confirmation)>,
    attempts: Vec<PublishAttempt>,
    acked: Vec<Message>,
    max_unacked: usize,
}

#[derive(Debug, Default)]
struct SessionState {
    confirms: Option<mpsc::UnboundedSender<Confirmation>>,
    consumers: Vec<ConsumerState>,
    prefetch: u16,
    publish_seq: u64,
}

#[derive(Debug)]
struct ConsumerState {
    queue: String,
    tx: mpsc::UnboundedSender<Delivery>,
    unacked: BTreeMap<u64, Message>,
}

impl State {
    fn session(&mut self, id: u64) -> BrokerResult<&mut SessionState> {
        self.sessions
            .get_mut(&id)
            .ok_or_else(|| BrokerError::transport(format!("session {id} is closed")))
    }

    fn kill(&mut self, id: u64) {
        let Some(session) = self.sessions.remove(&id) else {
            return;
        };
        for consumer in session.consumers {
            let queue = self.queues.entry(consumer.queue).or_default();
            for (_, body) in consumer.unacked.into_iter().rev() {
                queue.push_front(body);
            }
        }
        self.dispatch();
    }

    fn dispatch(&mut self) {
        let Self {
            sessions,
            queues,
            next_tag,
            max_unacked,
            ..
        } = self;

        for session in sessions.values_mut() {
            let limit = usize::from(session.prefetch);
            for consumer in &mut session.consumers {
                let Some(queue) = queues.get_mut(&consumer.queue) else {
                    continue;
                };
                while limit == 0 || consumer.unacked.len() < limit {
                    let Some(body) = queue.pop_front() else {
                        break;
                    };
                    *next_tag += 1;
                    let delivery = Delivery {
                        delivery_tag: *next_tag,
                        body: body.clone(),
                    };
                    if consumer.tx.send(delivery).is_err() {
                        queue.push_front(body);
                        break;
                    }
                    consumer.unacked.insert(*next_tag, body);
                    *max_unacked = (*max_unacked).max(consumer.unacked.len());
                }
            }
        }
    }
}

/// Shared in-memory broker
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    /// Creates an empty broker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a connector dialing this broker
    #[must_use]
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    /// Enqueues a message as if a producer had sent it
    pub fn enqueue(&self, queue: &str, body: impl Into<Message>) {
        let mut state = self.state.lock();
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(body.into());
        state.dispatch();
    }

    /// Messages accepted by an exchange, in order
    #[must_use]
    pub fn published(&self, exchange: &str) -> Vec<Message> {
        self.state
            .lock()
            .exchanges
            .get(exchange)
            .cloned()
            .unwrap_or_default()
    }

    /// Messages accepted by an exchange, decoded lossily
    #[must_use]
    pub fn published_text(&self, exchange: &str) -> Vec<String> {
        self.published(exchange)
            .iter()
            .map(|m| String::from_utf8_lossy(m).into_owned())
            .collect()
    }

    /// Returns true if the exchange was declared
    #[must_use]
    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.state.lock().declared_exchanges.contains(exchange)
    }

    /// Every publish attempt, including failed ones
    #[must_use]
    pub fn attempts(&self) -> Vec<PublishAttempt> {
        self.state.lock().attempts.clone()
    }

    /// Bodies acknowledged by consumers, in order
    #[must_use]
    pub fn acked(&self) -> Vec<Message> {
        self.state.lock().acked.clone()
    }

    /// Messages still waiting in a queue
    #[must_use]
    pub fn queue_len(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Deliveries currently awaiting acknowledgment
    #[must_use]
    pub fn unacked(&self) -> usize {
        self.state
            .lock()
            .sessions
            .values()
            .flat_map(|s| s.consumers.iter())
            .map(|c| c.unacked.len())
            .sum()
    }

    /// Highest number of unacknowledged deliveries a consumer ever held
    #[must_use]
    pub fn max_unacked(&self) -> usize {
        self.state.lock().max_unacked
    }

    /// Number of successful dials
    #[must_use]
    pub fn dials(&self) -> usize {
        self.state.lock().dials
    }

    /// Number of live sessions
    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Makes every following dial fail
    pub fn fail_dials(&self, fail: bool) {
        self.state.lock().fail_dials = fail;
    }

    /// Makes the next `count` publishes fail in transit, killing their session
    pub fn fail_next_publishes(&self, count: usize) {
        self.state.lock().fail_publishes = count;
    }

    /// Makes the next `count` exchange declarations fail, killing their session
    pub fn fail_next_declares(&self, count: usize) {
        self.state.lock().fail_declares = count;
    }

    /// Makes the next `count` accepted publishes negatively confirmed
    pub fn nack_next_publishes(&self, count: usize) {
        self.state.lock().nack_publishes = count;
    }

    /// Rejects confirm mode on new sessions
    pub fn set_confirms_supported(&self, supported: bool) {
        self.state.lock().confirms_unsupported = !supported;
    }

    /// Holds confirmations back until [`release_confirms`](Self::release_confirms)
    pub fn hold_confirms(&self, hold: bool) {
        self.state.lock().hold_confirms = hold;
    }

    /// Sends every held confirmation whose session is still alive
    pub fn release_confirms(&self) {
        let mut state = self.state.lock();
        let held = std::mem::take(&mut state.held);
        for (session, confirmation) in held {
            if let Some(tx) = state
                .sessions
                .get(&session)
                .and_then(|s| s.confirms.as_ref())
            {
                let _ = tx.send(confirmation);
            }
        }
    }

    /// Confirmations currently held back
    #[must_use]
    pub fn held_confirms(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Drops every live session, as a broker restart would
    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        let ids: Vec<u64> = state.sessions.keys().copied().collect();
        for id in ids {
            state.kill(id);
        }
    }

    /// Polls `check` until it holds or `timeout` elapses
    pub async fn wait_until(&self, timeout: Duration, check: impl Fn(&MemoryBroker) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if check(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Connector for a [`MemoryBroker`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    type Session = MemorySession;

    fn target(&self) -> String {
        "memory://".to_string()
    }

    async fn dial(&self) -> BrokerResult<MemorySession> {
        let mut state = self.broker.state.lock();
        if state.fail_dials {
            return Err(BrokerErrorKind::Dial {
                target: self.target(),
                reason: "connection refused".to_string(),
            }
            .into());
        }
        state.next_session += 1;
        state.dials += 1;
        let id = state.next_session;
        state.sessions.insert(id, SessionState::default());
        Ok(MemorySession {
            broker: self.broker.clone(),
            id,
        })
    }
}

/// A session on a [`MemoryBroker`]
#[derive(Debug)]
pub struct MemorySession {
    broker: MemoryBroker,
    id: u64,
}

impl MemorySession {
    /// Session ID, as recorded in [`PublishAttempt::session`]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn declare_exchange(&self, name: &str) -> BrokerResult<()> {
        let mut state = self.broker.state.lock();
        state.session(self.id)?;
        if state.fail_declares > 0 {
            state.fail_declares -= 1;
            state.kill(self.id);
            return Err(BrokerError::transport(format!(
                "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{name}'"
            )));
        }
        state.declared_exchanges.insert(name.to_string());
        Ok(())
    }

    async fn enable_confirms(&mut self) -> BrokerResult<ConfirmStream> {
        let mut state = self.broker.state.lock();
        if state.confirms_unsupported {
            return Err(BrokerErrorKind::ConfirmsUnsupported {
                reason: "confirm.select refused".to_string(),
            }
            .into());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.session(self.id)?.confirms = Some(tx);
        Ok(unbounded_stream(rx))
    }

    async fn publish(&self, exchange: &str, body: &[u8]) -> BrokerResult<()> {
        let mut state = self.broker.state.lock();
        state.session(self.id)?;

        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            state.attempts.push(PublishAttempt {
                session: self.id,
                exchange: exchange.to_string(),
                body: body.to_vec(),
                delivered: false,
            });
            state.kill(self.id);
            return Err(BrokerError::transport("connection reset by peer"));
        }

        state.attempts.push(PublishAttempt {
            session: self.id,
            exchange: exchange.to_string(),
            body: body.to_vec(),
            delivered: true,
        });
        state
            .exchanges
            .entry(exchange.to_string())
            .or_default()
            .push(body.to_vec());

        let ack = if state.nack_publishes > 0 {
            state.nack_publishes -= 1;
            false
        } else {
            true
        };
        let hold = state.hold_confirms;
        let session = state.session(self.id)?;
        let Some(tx) = session.confirms.clone() else {
            return Ok(());
        };
        session.publish_seq += 1;
        let confirmation = Confirmation {
            delivery_tag: session.publish_seq,
            ack,
        };
        if hold {
            state.held.push((self.id, confirmation));
        } else {
            let _ = tx.send(confirmation);
        }
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> BrokerResult<()> {
        let mut state = self.broker.state.lock();
        state.session(self.id)?;
        state.queues.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> BrokerResult<()> {
        let mut state = self.broker.state.lock();
        state.session(self.id)?.prefetch = count;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> BrokerResult<DeliveryStream> {
        let mut state = self.broker.state.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        state.session(self.id)?.consumers.push(ConsumerState {
            queue: queue.to_string(),
            tx,
            unacked: BTreeMap::new(),
        });
        state.dispatch();
        Ok(unbounded_stream(rx))
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        let mut state = self.broker.state.lock();
        let session = state.session(self.id)?;
        let body = session
            .consumers
            .iter_mut()
            .find_map(|c| c.unacked.remove(&delivery_tag))
            .ok_or_else(|| BrokerError::protocol("ack", format!("unknown tag {delivery_tag}")))?;
        state.acked.push(body);
        state.dispatch();
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        self.broker.state.lock().kill(self.id);
        Ok(())
    }
}
