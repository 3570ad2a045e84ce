//! # Shipwright
//!
//! Deployment worker library. The binary wires these pieces together; the
//! building blocks live in the workspace crates:
//!
//! - `shipwright-core`: job model, wire messages and the job store contract
//! - `shipwright-broker`: reconnecting AMQP sessions, publisher and subscriber
//! - `shipwright-executor`: repository synchronization and command execution
//! - `shipwright-worker`: job dispatcher, log fanout and notifications
//! - `shipwright-infrastructure`: PostgreSQL store, SMTP and webhook senders
//!
//! ## Example
//!
//! ```no_run
//! use shipwright::infrastructure::{WorkerSettings, init_logging};
//!
//! # async fn start() -> anyhow::Result<()> {
//! let settings = WorkerSettings::default();
//! init_logging(&settings.log_level);
//! shipwright::service::run(settings).await
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod infrastructure;
pub mod service;

pub use infrastructure::{WorkerSettings, init_logging};
