use super::{Publish, Publisher, Transport, TransportError, ERROR_CHANNEL_CAPACITY};
use crate::bus::{Broker, BusMessage, SessionId, SUBSCRIPTION_CAPACITY};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::warn;

type SessionSlot = Arc<Mutex<Option<SessionId>>>;

fn current(slot: &SessionSlot) -> Option<SessionId> {
    *slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn replace(slot: &SessionSlot, session: Option<SessionId>) -> Option<SessionId> {
    let mut guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    core::mem::replace(&mut *guard, session)
}

pub struct MemoryTransport {
    broker: Broker,
    client_id: String,
    session: SessionSlot,
    // Held so a dropped session does not read as end-of-stream to the
    // subscriber; released on the next connect.
    routes: Vec<mpsc::Sender<BusMessage>>,
    errors_tx: mpsc::Sender<TransportError>,
    errors_rx: Option<mpsc::Receiver<TransportError>>,
}

impl MemoryTransport {
    pub fn new(broker: Broker, client_id: &str) -> Self {
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            broker,
            client_id: client_id.to_string(),
            session: Arc::new(Mutex::new(None)),
            routes: Vec::new(),
            errors_tx,
            errors_rx: Some(errors_rx),
        }
    }

    /// Handle for cutting the link from outside the owner.
    pub fn link(&self) -> MemoryLink {
        MemoryLink {
            broker: self.broker.clone(),
            session: Arc::clone(&self.session),
            errors_tx: self.errors_tx.clone(),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&mut self, last_will: BusMessage) -> Result<(), TransportError> {
        let session = self.broker.open_session(&self.client_id, Some(last_will))?;
        if let Some(previous) = replace(&self.session, Some(session)) {
            let _ = self.broker.close_session(previous, true);
        }
        self.routes.clear();
        Ok(())
    }

    async fn subscribe(
        &mut self,
        filter: &str,
    ) -> Result<mpsc::Receiver<BusMessage>, TransportError> {
        let session = current(&self.session).ok_or(TransportError::NotConnected)?;
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.broker.attach(session, filter, sender.clone())?;
        self.routes.push(sender);
        Ok(receiver)
    }

    fn publisher(&self) -> Publisher {
        Arc::new(MemoryPublisher {
            broker: self.broker.clone(),
            session: Arc::clone(&self.session),
        })
    }

    fn take_errors(&mut self) -> Option<mpsc::Receiver<TransportError>> {
        self.errors_rx.take()
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.routes.clear();
        match replace(&self.session, None) {
            Some(session) => Ok(self.broker.close_session(session, true)?),
            None => Err(TransportError::NotConnected),
        }
    }
}

struct MemoryPublisher {
    broker: Broker,
    session: SessionSlot,
}

#[async_trait]
impl Publish for MemoryPublisher {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), TransportError> {
        if current(&self.session).is_none() {
            return Err(TransportError::NotConnected);
        }
        self.broker.publish(&BusMessage::new(topic, payload));
        Ok(())
    }
}

#[derive(Clone)]
pub struct MemoryLink {
    broker: Broker,
    session: SessionSlot,
    errors_tx: mpsc::Sender<TransportError>,
}

impl MemoryLink {
    /// Drop the session uncleanly: the broker delivers the last will and
    /// the owner sees a `ConnectionLost` error.
    pub fn sever(&self) {
        if let Some(session) = replace(&self.session, None) {
            let _ = self.broker.close_session(session, false);
        }
        if self
            .errors_tx
            .try_send(TransportError::ConnectionLost("link severed".into()))
            .is_err()
        {
            warn!("Transport error channel full or closed");
        }
    }

    pub fn is_connected(&self) -> bool {
        current(&self.session).is_some()
    }
}
