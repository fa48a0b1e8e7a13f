//! Server side of the TCP frame protocol: exposes a [`Broker`] to remote
//! [`TcpTransport`](super::TcpTransport) clients.

use super::tcp::{write_frame, Frame};
use super::TransportError;
use crate::bus::{Broker, BusMessage, SessionId, SUBSCRIPTION_CAPACITY};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Accept clients forever, one task per connection.
pub async fn serve(listener: TcpListener, broker: Broker) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("🔗 New client connected: {}", addr);
                let client_broker = broker.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, client_broker).await {
                        warn!("Client {} error: {}", addr, e);
                    }
                    info!("🔌 Client {} disconnected", addr);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Serve one client until it disconnects. A client that goes away without
/// a `Disconnect` frame has its last will published.
pub async fn handle_client(stream: TcpStream, broker: Broker) -> Result<(), TransportError> {
    let (reader, writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    // Everything the broker routes to this client funnels through one queue
    let (outbound_tx, outbound_rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
    let forward_task = tokio::spawn(forward_messages(outbound_rx, writer));

    let mut session: Option<SessionId> = None;
    let mut clean = false;

    let result = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(TransportError::from(e)),
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let frame = match Frame::parse(trimmed) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                continue;
            }
        };

        match (frame, session) {
            (Frame::Connect { client_id, will }, None) => {
                match broker.open_session(&client_id, will) {
                    Ok(id) => session = Some(id),
                    Err(e) => break Err(e.into()),
                }
            }
            (Frame::Connect { client_id, .. }, Some(id)) => {
                warn!("Session {} sent a second Connect as {}, ignoring", id, client_id);
            }
            (Frame::Subscribe { filter }, Some(id)) => {
                if let Err(e) = broker.attach(id, &filter, outbound_tx.clone()) {
                    break Err(e.into());
                }
            }
            (Frame::Publish { topic, payload }, Some(_)) => {
                let message = BusMessage { topic, payload };
                let delivered = broker.publish(&message);
                debug!("📨 {} -> {} subscribers", message.topic, delivered);
            }
            (Frame::Disconnect, _) => {
                clean = true;
                break Ok(());
            }
            (Frame::Message { .. }, _) => {
                warn!("Clients may not send Message frames, ignoring");
            }
            (_, None) => {
                break Err(TransportError::NotConnected);
            }
        }
    };

    if let Some(id) = session {
        let _ = broker.close_session(id, clean);
    }
    drop(outbound_tx);
    forward_task.abort();
    result
}

async fn forward_messages(mut outbound_rx: mpsc::Receiver<BusMessage>, mut writer: OwnedWriteHalf) {
    while let Some(message) = outbound_rx.recv().await {
        let frame = Frame::Message {
            topic: message.topic,
            payload: message.payload,
        };
        if let Err(e) = write_frame(&mut writer, &frame).await {
            warn!("Failed to forward message: {}", e);
            break;
        }
    }
}
