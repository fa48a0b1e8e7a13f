//! In-process publish/subscribe broker.
//!
//! Delivery is at-most-once: a subscriber whose queue is full misses the
//! message instead of stalling the publisher. Filters follow the MQTT
//! convention, `+` matches exactly one level and a trailing `#` matches
//! any remainder.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const SUBSCRIPTION_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

pub type SessionId = u64;

pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker is not accepting sessions")]
    Refused,
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
}

#[derive(Debug)]
struct Subscription {
    session: SessionId,
    filter: String,
    sender: mpsc::Sender<BusMessage>,
}

#[derive(Debug)]
struct Session {
    client_id: String,
    will: Option<BusMessage>,
}

#[derive(Debug)]
struct BrokerInner {
    next_session: SessionId,
    sessions: HashMap<SessionId, Session>,
    subscriptions: Vec<Subscription>,
    accepting: bool,
}

/// Cheap to clone; all clones route through the same table.
#[derive(Debug, Clone)]
pub struct Broker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BrokerInner {
                next_session: 1,
                sessions: HashMap::new(),
                subscriptions: Vec::new(),
                accepting: true,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        // A poisoned table is still structurally valid
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Refuse (or accept again) new sessions. Used to simulate an
    /// unreachable broker.
    pub fn set_accepting(&self, accepting: bool) {
        self.lock().accepting = accepting;
    }

    pub fn open_session(
        &self,
        client_id: &str,
        will: Option<BusMessage>,
    ) -> Result<SessionId, BrokerError> {
        let mut inner = self.lock();
        if !inner.accepting {
            return Err(BrokerError::Refused);
        }

        let id = inner.next_session;
        inner.next_session = inner.next_session.wrapping_add(1);
        inner.sessions.insert(
            id,
            Session {
                client_id: client_id.to_string(),
                will,
            },
        );
        info!("🔗 Session {} opened for {}", id, client_id);
        Ok(id)
    }

    pub fn subscribe(
        &self,
        session: SessionId,
        filter: &str,
    ) -> Result<mpsc::Receiver<BusMessage>, BrokerError> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.attach(session, filter, sender)?;
        Ok(receiver)
    }

    /// Route matches into a caller-owned channel. The broker drops its
    /// clone of `sender` when the session closes; the channel itself stays
    /// open as long as the caller holds another clone.
    pub fn attach(
        &self,
        session: SessionId,
        filter: &str,
        sender: mpsc::Sender<BusMessage>,
    ) -> Result<(), BrokerError> {
        let mut inner = self.lock();
        if !inner.sessions.contains_key(&session) {
            return Err(BrokerError::UnknownSession(session));
        }

        inner.subscriptions.push(Subscription {
            session,
            filter: filter.to_string(),
            sender,
        });
        debug!("Session {} subscribed to {}", session, filter);
        Ok(())
    }

    /// Route `message` to every matching subscriber. Returns how many
    /// subscribers received it.
    pub fn publish(&self, message: &BusMessage) -> usize {
        let mut inner = self.lock();
        let mut delivered = 0;

        inner.subscriptions.retain(|sub| {
            if !topic_matches(&sub.filter, &message.topic) {
                return true;
            }
            match sub.sender.try_send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "Subscriber queue full on session {}, dropping {}",
                        sub.session, message.topic
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        delivered
    }

    /// End a session. An unclean close delivers the session's last will.
    pub fn close_session(&self, session: SessionId, clean: bool) -> Result<(), BrokerError> {
        let removed = {
            let mut inner = self.lock();
            inner.subscriptions.retain(|sub| sub.session != session);
            inner.sessions.remove(&session)
        };

        let Some(removed) = removed else {
            return Err(BrokerError::UnknownSession(session));
        };

        if clean {
            info!("🔌 Session {} ({}) closed", session, removed.client_id);
        } else {
            warn!("💀 Session {} ({}) dropped", session, removed.client_id);
            if let Some(will) = removed.will {
                self.publish(&will);
            }
        }
        Ok(())
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("Tank/AskState", "Tank/AskState"));
        assert!(topic_matches("Controller/+/State", "Controller/ipad/State"));
        assert!(!topic_matches("Controller/+/State", "Controller/ipad/Heartbeat"));
        assert!(!topic_matches("Controller/+/State", "Controller/a/b/State"));
        assert!(topic_matches("Tank/#", "Tank/abc/Sensors"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("Tank/abc", "Tank/abc/State"));
        assert!(!topic_matches("Tank/abc/State", "Tank/abc"));
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers_only() {
        let broker = Broker::new();
        let session = broker.open_session("t", None).unwrap();
        let mut state = broker.subscribe(session, "Controller/+/State").unwrap();
        let mut beats = broker.subscribe(session, "Controller/+/Heartbeat").unwrap();

        let delivered = broker.publish(&BusMessage::new("Controller/c1/State", "{}"));
        assert_eq!(delivered, 1);
        assert_eq!(state.recv().await.unwrap().topic, "Controller/c1/State");
        assert!(beats.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unclean_close_publishes_will() {
        let broker = Broker::new();
        let watcher = broker.open_session("watcher", None).unwrap();
        let mut rx = broker.subscribe(watcher, "Tank/+/State").unwrap();

        let will = BusMessage::new("Tank/t1/State", r#"{"TankId":"t1","State":"Down"}"#);
        let tank = broker.open_session("t1", Some(will.clone())).unwrap();
        broker.close_session(tank, false).unwrap();

        assert_eq!(rx.recv().await.unwrap(), will);
    }

    #[tokio::test]
    async fn test_clean_close_suppresses_will() {
        let broker = Broker::new();
        let watcher = broker.open_session("watcher", None).unwrap();
        let mut rx = broker.subscribe(watcher, "#").unwrap();

        let tank = broker
            .open_session("t1", Some(BusMessage::new("Tank/t1/State", "down")))
            .unwrap();
        broker.close_session(tank, true).unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(broker.session_count(), 1);
    }

    #[test]
    fn test_refusing_broker() {
        let broker = Broker::new();
        broker.set_accepting(false);
        assert_eq!(broker.open_session("t1", None), Err(BrokerError::Refused));
    }
}
