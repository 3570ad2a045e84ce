//! # Shipwright Broker
//!
//! Reconnecting publish/subscribe for the Shipwright worker.
//!
//! ## Architecture
//!
//! - `transport`: The `Connector`/`Session` seam, an AMQP implementation and
//!   an in-memory implementation for tests
//! - `session`: The session factory handing out one live session at a time
//! - `publisher`: Confirmed publishing with retry on reconnect
//! - `subscriber`: Single-flight queue consumption
//! - `bus`: Single-slot and rendezvous channels connecting the broker loops
//!   to the application
//!
//! ## Example
//!
//! ```rust,ignore
//! use shipwright_broker::{AmqpConnector, DialPolicy, ReliablePublisher, SessionFactory, bus};
//! use tokio_util::sync::CancellationToken;
//!
//! let cancel = CancellationToken::new();
//! let factory = SessionFactory::new(AmqpConnector::new(url), DialPolicy::default());
//! let (statuses, inbound) = bus::single_slot();
//! ReliablePublisher::new("job_statuses")
//!     .run(factory.spawn(cancel.clone()), inbound)
//!     .await?;
//! ```

#![warn(missing_docs)]
#![warn(unused)]
#![warn(clippy::pedantic)]

pub mod bus;
pub mod publisher;
pub mod session;
pub mod subscriber;
pub mod transport;

#[cfg(feature = "amqp")]
pub use transport::amqp::{AmqpConnector, AmqpSession};
#[cfg(any(test, feature = "test-support"))]
pub use transport::memory::{MemoryBroker, MemoryConnector, MemorySession, PublishAttempt};
pub use bus::{HandoffReceiver, HandoffSender};
pub use publisher::ReliablePublisher;
pub use session::{DialPolicy, SessionFactory, SessionStream};
pub use subscriber::QueuedSubscriber;
pub use transport::{
    ConfirmStream, Confirmation, Connector, Delivery, DeliveryStream, Message, Session,
};

/// Broker error
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct BrokerError(#[from] BrokerErrorKind);

/// Specific broker error kinds
#[derive(Debug, thiserror::Error)]
pub enum BrokerErrorKind {
    #[error("cannot (re)dial {target}: {reason}")]
    Dial { target: String, reason: String },

    #[error("cannot create channel: {reason}")]
    Channel { reason: String },

    #[error("transport failure: {reason}")]
    Transport { reason: String },

    #[error("{operation} failed: {reason}")]
    Protocol {
        operation: &'static str,
        reason: String,
    },

    #[error("publisher confirms not supported: {reason}")]
    ConfirmsUnsupported { reason: String },
}

impl BrokerError {
    /// Returns true when the session this error came from is no longer usable
    #[must_use]
    pub fn is_session_lost(&self) -> bool {
        matches!(
            self.0,
            BrokerErrorKind::Transport { .. } | BrokerErrorKind::Channel { .. }
        )
    }

    pub(crate) fn transport(reason: impl std::fmt::Display) -> Self {
        Self(BrokerErrorKind::Transport {
            reason: reason.to_string(),
        })
    }

    pub(crate) fn protocol(operation: &'static str, reason: impl std::fmt::Display) -> Self {
        Self(BrokerErrorKind::Protocol {
            operation,
            reason: reason.to_string(),
        })
    }
}

/// Broker result type
pub type BrokerResult<T = ()> = Result<T, BrokerError>;
