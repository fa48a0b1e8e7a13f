//! Transport seam between the vehicle core and the message bus.
//!
//! The core only needs four things from a transport: register a last will
//! and connect, subscribe to a topic filter, publish, and report link
//! errors. [`MemoryTransport`] runs against an in-process [`Broker`]
//! (tests, demos); [`TcpTransport`] talks line-delimited JSON frames to a
//! `tank-broker` relay, whose server side is [`relay`].
//!
//! [`Broker`]: crate::bus::Broker

pub mod memory;
pub mod relay;
pub mod tcp;

pub use memory::{MemoryLink, MemoryTransport};
pub use tcp::{Frame, TcpTransport};

use crate::bus::{BrokerError, BusMessage};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Capacity of the transport-error channel. Errors past this are dropped;
/// one pending error is enough to trigger a reconnect.
pub const ERROR_CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {reason}")]
    ConnectFailed { addr: String, reason: String },
    #[error("broker refused the session")]
    Refused,
    #[error("not connected")]
    NotConnected,
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("malformed frame: {0}")]
    Frame(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BrokerError> for TransportError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::Refused => TransportError::Refused,
            BrokerError::UnknownSession(_) => TransportError::NotConnected,
        }
    }
}

/// The narrow outward capability handed to anything that only needs to
/// emit messages (the telemetry worker, the router).
#[async_trait]
pub trait Publish: Send + Sync {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), TransportError>;
}

pub type Publisher = Arc<dyn Publish>;

#[async_trait]
pub trait Transport: Send {
    /// Register `last_will` and open the session. Calling this on a live
    /// transport replaces the previous session.
    async fn connect(&mut self, last_will: BusMessage) -> Result<(), TransportError>;

    async fn subscribe(
        &mut self,
        filter: &str,
    ) -> Result<mpsc::Receiver<BusMessage>, TransportError>;

    /// Stays valid across reconnects.
    fn publisher(&self) -> Publisher;

    /// Link errors observed in the background. Can be taken once.
    fn take_errors(&mut self) -> Option<mpsc::Receiver<TransportError>>;

    /// Clean close: the last will is not delivered.
    async fn disconnect(&mut self) -> Result<(), TransportError>;
}
