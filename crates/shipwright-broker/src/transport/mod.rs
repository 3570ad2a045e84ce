//! Transport seam between the broker loops and a concrete message broker.
//!
//! A [`Session`] is one live connection plus one logical channel. Closing the
//! connection invalidates the channel, so a session is dropped as a whole
//! after any transport failure.

#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::mpsc;

use crate::BrokerResult;

/// Opaque message body
pub type Message = Vec<u8>;

/// Broker acknowledgment of a published message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    /// Sequence number of the publish on its session
    pub delivery_tag: u64,
    /// Positive or negative acknowledgment
    pub ack: bool,
}

/// A message delivered from a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Tag used to acknowledge the delivery on its session
    pub delivery_tag: u64,
    /// Message body
    pub body: Message,
}

/// Confirmations of a session; ends when the session is lost
pub type ConfirmStream = BoxStream<'static, Confirmation>;

/// Deliveries of a consumer; ends when the session is lost
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Dials new sessions
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Session type produced by this connector
    type Session: Session;

    /// Connection target, safe to log
    fn target(&self) -> String;

    /// Opens a connection and a logical channel on it
    async fn dial(&self) -> BrokerResult<Self::Session>;
}

/// One live connection and channel pair
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Declares a durable fanout exchange
    async fn declare_exchange(&self, name: &str) -> BrokerResult<()>;

    /// Puts the channel in confirm mode
    async fn enable_confirms(&mut self) -> BrokerResult<ConfirmStream>;

    /// Publishes a message to an exchange
    async fn publish(&self, exchange: &str, body: &[u8]) -> BrokerResult<()>;

    /// Declares a durable queue
    async fn declare_queue(&self, name: &str) -> BrokerResult<()>;

    /// Limits the number of unacknowledged deliveries
    async fn set_prefetch(&self, count: u16) -> BrokerResult<()>;

    /// Starts consuming a queue with manual acknowledgment
    async fn consume(&self, queue: &str) -> BrokerResult<DeliveryStream>;

    /// Positively acknowledges one delivery
    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()>;

    /// Tears the connection down, taking the channel with it
    async fn close(&self) -> BrokerResult<()>;
}

pub(crate) fn unbounded_stream<T: Send + 'static>(
    rx: mpsc::UnboundedReceiver<T>,
) -> BoxStream<'static, T> {
    futures::stream::unfold(rx, |mut rx| async move {
        let item = rx.recv().await?;
        Some((item, rx))
    })
    .boxed()
}

/// Strips credentials from a connection URI
#[must_use]
pub fn redact_uri(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &uri[..scheme_end], &uri[at..])
        }
        _ => uri.to_string(),
    }
}
