#![allow(dead_code)]

use std::time::Duration;
use tankbus::actuator::LogActuator;
use tankbus::bus::{Broker, BusMessage};
use tankbus::protocol::{decode, TankStateMsg, VehicleState};
use tankbus::telemetry::TelemetrySnapshot;
use tankbus::transport::{MemoryLink, MemoryTransport};
use tankbus::{Result, Vehicle, VehicleOptions};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub const TANK: &str = "tank-1";

pub type MemoryVehicle = Vehicle<MemoryTransport, LogActuator>;

pub struct Rig {
    pub broker: Broker,
    pub observer: mpsc::Receiver<BusMessage>,
    pub link: MemoryLink,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<(MemoryVehicle, Result<()>)>>,
}

impl Rig {
    /// Observer on `Tank/#`, then a running vehicle on the same broker.
    pub fn start(heartbeat_period: Duration) -> Self {
        Self::start_with(heartbeat_period, LogActuator::new())
    }

    pub fn start_with(heartbeat_period: Duration, actuator: LogActuator) -> Self {
        let broker = Broker::new();
        let session = broker.open_session("observer", None).unwrap();
        let observer = broker.subscribe(session, "Tank/#").unwrap();

        let transport = MemoryTransport::new(broker.clone(), TANK);
        let link = transport.link();
        let options = VehicleOptions {
            heartbeat_period,
            ..VehicleOptions::default()
        };
        let mut vehicle = Vehicle::new(TANK, transport, actuator, options);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let result = vehicle
                .run(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            (vehicle, result)
        });

        Self {
            broker,
            observer,
            link,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Publish as a controller would.
    pub fn send(&self, topic: &str, payload: &str) {
        self.broker.publish(&BusMessage::new(topic, payload));
    }

    pub async fn expect(&mut self, topic: &str) -> BusMessage {
        self.expect_within(topic, Duration::from_secs(2)).await
    }

    /// Next message on `topic`, skipping anything else.
    pub async fn expect_within(&mut self, topic: &str, limit: Duration) -> BusMessage {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let message = tokio::time::timeout_at(deadline, self.observer.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {}", topic))
                .expect("observer closed");
            if message.topic == topic {
                return message;
            }
        }
    }

    pub async fn expect_state(&mut self, state: VehicleState) {
        let message = self.expect(&format!("Tank/{}/State", TANK)).await;
        let msg: TankStateMsg = decode(&message.topic, &message.payload).unwrap();
        assert_eq!(msg.tank_id, TANK);
        assert_eq!(msg.state, state);
    }

    pub async fn expect_sensors(&mut self) -> TelemetrySnapshot {
        let message = self.expect(&format!("Tank/{}/Sensors", TANK)).await;
        decode(&message.topic, &message.payload).unwrap()
    }

    /// Everything already delivered to the observer.
    pub fn drain(&mut self) -> Vec<BusMessage> {
        let mut seen = Vec::new();
        while let Ok(message) = self.observer.try_recv() {
            seen.push(message);
        }
        seen
    }

    pub async fn stop(&mut self) -> (MemoryVehicle, Result<()>) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.join().await
    }

    /// Wait for the loop to exit on its own.
    pub async fn join(&mut self) -> (MemoryVehicle, Result<()>) {
        let handle = self.handle.take().expect("vehicle already joined");
        tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .expect("vehicle did not exit")
            .expect("vehicle task panicked")
    }
}

pub fn topic(leaf: &str) -> String {
    format!("Tank/{}/{}", TANK, leaf)
}

pub fn ask_pair(controller: &str) -> String {
    format!(r#"{{"ControllerId":"{}","TankId":"{}"}}"#, controller, TANK)
}

pub fn drive(controller: &str, speed: i16, direction: i16) -> String {
    format!(
        r#"{{"ControllerId":"{}","TankId":"{}","Speed":{},"Direction":{}}}"#,
        controller, TANK, speed, direction
    )
}

pub fn heartbeat(controller: &str) -> String {
    format!(r#"{{"ControllerId":"{}"}}"#, controller)
}

pub fn controller_state(controller: &str, state: &str) -> String {
    format!(r#"{{"ControllerId":"{}","State":"{}"}}"#, controller, state)
}
