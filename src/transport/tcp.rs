use super::{Publish, Publisher, Transport, TransportError, ERROR_CHANNEL_CAPACITY};
use crate::bus::{topic_matches, BusMessage, SUBSCRIPTION_CAPACITY};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_FRAME_SIZE: usize = 4096;

/// One line on the wire between a client and `tank-broker`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Frame {
    Connect {
        client_id: String,
        will: Option<BusMessage>,
    },
    Subscribe {
        filter: String,
    },
    Publish {
        topic: String,
        payload: String,
    },
    Message {
        topic: String,
        payload: String,
    },
    Disconnect,
}

impl Frame {
    pub fn parse(line: &str) -> Result<Self, TransportError> {
        if line.len() > MAX_FRAME_SIZE {
            return Err(TransportError::Frame(format!("{} bytes", line.len())));
        }
        serde_json::from_str(line).map_err(|e| TransportError::Frame(e.to_string()))
    }
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut line =
        serde_json::to_string(frame).map_err(|e| TransportError::Frame(e.to_string()))?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}

type SharedWriter = Arc<Mutex<Option<OwnedWriteHalf>>>;

struct Route {
    filter: String,
    sender: mpsc::Sender<BusMessage>,
}

type RouteTable = Arc<StdMutex<Vec<Route>>>;

pub struct TcpTransport {
    addr: String,
    client_id: String,
    writer: SharedWriter,
    routes: RouteTable,
    closing: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    errors_tx: mpsc::Sender<TransportError>,
    errors_rx: Option<mpsc::Receiver<TransportError>>,
}

impl TcpTransport {
    pub fn new(addr: &str, client_id: &str) -> Self {
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            addr: addr.to_string(),
            client_id: client_id.to_string(),
            writer: Arc::new(Mutex::new(None)),
            routes: Arc::new(StdMutex::new(Vec::new())),
            closing: Arc::new(AtomicBool::new(false)),
            reader: None,
            errors_tx,
            errors_rx: Some(errors_rx),
        }
    }

    async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;
        write_frame(writer, frame).await
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&mut self, last_will: BusMessage) -> Result<(), TransportError> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }

        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransportError::ConnectFailed {
                    addr: self.addr.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(TransportError::ConnectFailed {
                    addr: self.addr.clone(),
                    reason: "timed out".into(),
                })
            }
        };

        let (read_half, mut write_half) = stream.into_split();
        write_frame(
            &mut write_half,
            &Frame::Connect {
                client_id: self.client_id.clone(),
                will: Some(last_will),
            },
        )
        .await?;

        routes_lock(&self.routes).clear();
        *self.writer.lock().await = Some(write_half);
        self.closing.store(false, Ordering::SeqCst);

        self.reader = Some(tokio::spawn(read_loop(
            read_half,
            Arc::clone(&self.routes),
            Arc::clone(&self.writer),
            Arc::clone(&self.closing),
            self.errors_tx.clone(),
        )));

        info!("🌐 Connected to broker at {}", self.addr);
        Ok(())
    }

    async fn subscribe(
        &mut self,
        filter: &str,
    ) -> Result<mpsc::Receiver<BusMessage>, TransportError> {
        self.send(&Frame::Subscribe {
            filter: filter.to_string(),
        })
        .await?;

        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        routes_lock(&self.routes).push(Route {
            filter: filter.to_string(),
            sender,
        });
        Ok(receiver)
    }

    fn publisher(&self) -> Publisher {
        Arc::new(TcpPublisher {
            writer: Arc::clone(&self.writer),
        })
    }

    fn take_errors(&mut self) -> Option<mpsc::Receiver<TransportError>> {
        self.errors_rx.take()
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.closing.store(true, Ordering::SeqCst);
        let result = self.send(&Frame::Disconnect).await;

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        routes_lock(&self.routes).clear();
        result
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

fn routes_lock(routes: &RouteTable) -> std::sync::MutexGuard<'_, Vec<Route>> {
    routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn read_loop(
    read_half: OwnedReadHalf,
    routes: RouteTable,
    writer: SharedWriter,
    closing: Arc<AtomicBool>,
    errors_tx: mpsc::Sender<TransportError>,
) {
    let mut lines = BufReader::new(read_half).lines();

    let reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match Frame::parse(trimmed) {
                    Ok(Frame::Message { topic, payload }) => {
                        dispatch(&routes, BusMessage { topic, payload });
                    }
                    Ok(other) => debug!("Ignoring unexpected frame from broker: {:?}", other),
                    Err(e) => warn!("Dropping malformed frame from broker: {}", e),
                }
            }
            Ok(None) => break "broker closed the connection".to_string(),
            Err(e) => break e.to_string(),
        }
    };

    writer.lock().await.take();
    if closing.load(Ordering::SeqCst) {
        return;
    }

    error!("❌ Broker link lost: {}", reason);
    if errors_tx.try_send(TransportError::ConnectionLost(reason)).is_err() {
        warn!("Transport error channel full or closed");
    }
}

fn dispatch(routes: &RouteTable, message: BusMessage) {
    for route in routes_lock(routes).iter() {
        if !topic_matches(&route.filter, &message.topic) {
            continue;
        }
        if route.sender.try_send(message.clone()).is_err() {
            warn!("Subscriber for {} is not keeping up, dropping message", route.filter);
        }
    }
}

struct TcpPublisher {
    writer: SharedWriter,
}

#[async_trait]
impl Publish for TcpPublisher {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;
        write_frame(
            writer,
            &Frame::Publish {
                topic: topic.to_string(),
                payload,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_wire_format() {
        let frame = Frame::Publish {
            topic: "Tank/t1/State".into(),
            payload: r#"{"TankId":"t1","State":"Up"}"#.into(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.starts_with(r#"{"op":"Publish""#));
        assert_eq!(Frame::parse(&json).unwrap(), frame);

        assert_eq!(Frame::parse(r#"{"op":"Disconnect"}"#).unwrap(), Frame::Disconnect);
    }

    #[test]
    fn test_frame_rejects_unknown_op() {
        assert!(Frame::parse(r#"{"op":"Teleport"}"#).is_err());
        assert!(Frame::parse(&"x".repeat(MAX_FRAME_SIZE + 1)).is_err());
    }
}
