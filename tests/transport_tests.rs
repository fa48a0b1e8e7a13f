mod common;

use async_trait::async_trait;
use common::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tankbus::actuator::LogActuator;
use tankbus::bus::{Broker, BusMessage};
use tankbus::protocol::*;
use tankbus::transport::relay::serve;
use tankbus::transport::{Publish, Publisher, TcpTransport, Transport, TransportError};
use tankbus::{TankError, Vehicle, VehicleOptions};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

const QUIET: Duration = Duration::from_secs(600);

fn state_of(message: &BusMessage) -> VehicleState {
    decode::<TankStateMsg>(&message.topic, &message.payload)
        .unwrap()
        .state
}

#[tokio::test]
async fn test_severed_link_fires_will_and_reconnects() {
    let mut rig = Rig::start(QUIET);
    rig.expect_state(VehicleState::Up).await;

    rig.link.sever();

    // The broker delivers the will, then the vehicle comes back and says so
    rig.expect_state(VehicleState::Down).await;
    rig.expect_state(VehicleState::Up).await;
    assert!(rig.link.is_connected());

    rig.send(&topic("AskPair"), &ask_pair("A"));
    let reply = rig.expect(&topic("Pair")).await;
    let reply: TankPairMsg = decode(&reply.topic, &reply.payload).unwrap();
    assert_eq!(reply.response, PairResponse::Yes);

    let (vehicle, result) = rig.stop().await;
    assert!(result.is_ok());
    assert_eq!(vehicle.stats().reconnects, 1);
}

#[tokio::test]
async fn test_reconnect_refused_is_fatal() {
    let mut rig = Rig::start(QUIET);
    rig.expect_state(VehicleState::Up).await;

    rig.broker.set_accepting(false);
    rig.link.sever();
    rig.expect_state(VehicleState::Down).await;

    let (vehicle, result) = rig.join().await;
    let err = result.expect_err("reconnect should fail");
    assert!(matches!(err, TankError::Transport(TransportError::Refused)));
    assert!(err.is_fatal());
    assert_eq!(vehicle.state(), VehicleState::Down);
    assert_eq!(vehicle.treads().left, 0);
}

/// Transport whose subscription streams the test can cut at will.
#[derive(Clone, Default)]
struct ScriptedTransport {
    senders: Arc<Mutex<Vec<mpsc::Sender<BusMessage>>>>,
    published: Arc<Mutex<Vec<BusMessage>>>,
}

impl ScriptedTransport {
    fn close_streams(&self) {
        self.senders.lock().unwrap().clear();
    }

    fn published(&self) -> Vec<BusMessage> {
        self.published.lock().unwrap().clone()
    }
}

struct Recorder(Arc<Mutex<Vec<BusMessage>>>);

#[async_trait]
impl Publish for Recorder {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), TransportError> {
        self.0.lock().unwrap().push(BusMessage::new(topic, payload));
        Ok(())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&mut self, _last_will: BusMessage) -> Result<(), TransportError> {
        Ok(())
    }

    async fn subscribe(
        &mut self,
        _filter: &str,
    ) -> Result<mpsc::Receiver<BusMessage>, TransportError> {
        let (tx, rx) = mpsc::channel(8);
        self.senders.lock().unwrap().push(tx);
        Ok(rx)
    }

    fn publisher(&self) -> Publisher {
        Arc::new(Recorder(Arc::clone(&self.published)))
    }

    fn take_errors(&mut self) -> Option<mpsc::Receiver<TransportError>> {
        None
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_closed_stream_takes_vehicle_down() {
    let transport = ScriptedTransport::default();
    let handle = transport.clone();
    let mut vehicle = Vehicle::new(TANK, transport, LogActuator::new(), VehicleOptions::default());
    vehicle.start().await.unwrap();

    handle.close_streams();
    let result = vehicle.run(std::future::pending()).await;

    assert!(matches!(
        result,
        Err(TankError::Transport(TransportError::ConnectionLost(_)))
    ));
    let states: Vec<_> = handle
        .published()
        .iter()
        .filter(|m| m.topic == topic("State"))
        .map(state_of)
        .collect();
    assert_eq!(states, vec![VehicleState::Up, VehicleState::Down]);
}

async fn recv_state(observer: &mut mpsc::Receiver<BusMessage>) -> BusMessage {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), observer.recv())
            .await
            .expect("timed out")
            .expect("observer closed");
        if message.topic == topic("State") || message.topic == topic("Pair") {
            return message;
        }
    }
}

#[tokio::test]
async fn test_tcp_relay_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let broker = Broker::new();
    let relay = tokio::spawn(serve(listener, broker.clone()));

    let session = broker.open_session("observer", None).unwrap();
    let mut observer = broker.subscribe(session, "Tank/#").unwrap();

    let options = VehicleOptions {
        heartbeat_period: QUIET,
        ..VehicleOptions::default()
    };
    let mut vehicle = Vehicle::new(TANK, TcpTransport::new(&addr, TANK), LogActuator::new(), options);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let result = vehicle
            .run(async {
                let _ = shutdown_rx.await;
            })
            .await;
        (vehicle, result)
    });

    assert_eq!(state_of(&recv_state(&mut observer).await), VehicleState::Up);

    broker.publish(&BusMessage::new(topic("AskPair"), ask_pair("A")));
    let reply = recv_state(&mut observer).await;
    assert_eq!(reply.topic, topic("Pair"));
    let reply: TankPairMsg = decode(&reply.topic, &reply.payload).unwrap();
    assert_eq!(reply.response, PairResponse::Yes);
    assert_eq!(state_of(&recv_state(&mut observer).await), VehicleState::Paired);

    shutdown_tx.send(()).unwrap();
    let (vehicle, result) = task.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(vehicle.state(), VehicleState::Down);
    assert_eq!(state_of(&recv_state(&mut observer).await), VehicleState::Down);

    relay.abort();
}

#[tokio::test]
async fn test_tcp_dropped_client_fires_will() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let broker = Broker::new();
    let relay = tokio::spawn(serve(listener, broker.clone()));

    let session = broker.open_session("observer", None).unwrap();
    let mut observer = broker.subscribe(session, "Tank/#").unwrap();

    let options = VehicleOptions {
        heartbeat_period: QUIET,
        ..VehicleOptions::default()
    };
    let mut vehicle = Vehicle::new(TANK, TcpTransport::new(&addr, TANK), LogActuator::new(), options);
    let task = tokio::spawn(async move { vehicle.run(std::future::pending()).await });

    assert_eq!(state_of(&recv_state(&mut observer).await), VehicleState::Up);

    // No Disconnect frame: the relay sees the socket close
    task.abort();
    let _ = task.await;
    assert_eq!(state_of(&recv_state(&mut observer).await), VehicleState::Down);

    relay.abort();
}
