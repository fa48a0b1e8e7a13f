//! The vehicle core: one loop that owns every component and handles one
//! event at a time.
//!
//! Sources are the eight inbound subscriptions, the heartbeat timer, the
//! transport's error channel and the shutdown signal. Whichever is ready
//! first wins; there is no priority between them.

use crate::actuator::Actuator;
use crate::bus::BusMessage;
use crate::drive::{ActuatorPair, DriveTrain, Turret, TurretDirection};
use crate::error::Result;
use crate::heartbeat::{HeartbeatMonitor, TickVerdict};
use crate::pairing::{ControllerReport, PairingStateMachine};
use crate::protocol::{
    controller_heartbeat_topic, controller_state_topic, decode, encode, AskPairMsg, AskStateMsg,
    ControllerStateMsg, DriveMsg, HeartbeatMsg, PairResponse, TankPairMsg, TankStateMsg,
    TankTopics, TurretFireMsg, TurretMoveMsg, UnpairMsg, VehicleState, ASK_STATE_TOPIC,
};
use crate::telemetry::{run_emitter, Emission, EmitterStats, TelemetryPublisher, TelemetrySnapshot};
use crate::transport::{Publisher, Transport, TransportError};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Which inbound subscription a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    AskState,
    ControllerState,
    AskPair,
    Unpair,
    Drive,
    TurretMove,
    TurretFire,
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleOptions {
    pub heartbeat_period: Duration,
    /// `+` or a single controller id.
    pub controller_filter: String,
}

impl Default for VehicleOptions {
    fn default() -> Self {
        Self {
            heartbeat_period: crate::heartbeat::DEFAULT_HEARTBEAT_PERIOD,
            controller_filter: "+".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VehicleStats {
    pub messages_handled: u64,
    pub decode_errors: u64,
    pub reconnects: u32,
}

struct Subscriptions {
    ask_state: mpsc::Receiver<BusMessage>,
    controller_state: mpsc::Receiver<BusMessage>,
    ask_pair: mpsc::Receiver<BusMessage>,
    unpair: mpsc::Receiver<BusMessage>,
    drive: mpsc::Receiver<BusMessage>,
    turret_move: mpsc::Receiver<BusMessage>,
    turret_fire: mpsc::Receiver<BusMessage>,
    heartbeat: mpsc::Receiver<BusMessage>,
}

enum Event {
    Shutdown,
    Tick,
    LinkError(TransportError),
    Inbound(Route, Option<BusMessage>),
}

pub struct Vehicle<T: Transport, A: Actuator> {
    tank_id: String,
    topics: TankTopics,
    options: VehicleOptions,
    transport: T,
    publisher: Publisher,
    pairing: PairingStateMachine,
    drive: DriveTrain<A>,
    turret: Turret,
    telemetry: TelemetryPublisher,
    telemetry_rx: Option<mpsc::Receiver<Emission>>,
    emitter: Option<JoinHandle<EmitterStats>>,
    heartbeat: HeartbeatMonitor,
    subscriptions: Option<Subscriptions>,
    link_errors: Option<mpsc::Receiver<TransportError>>,
    stats: VehicleStats,
}

impl<T: Transport, A: Actuator> Vehicle<T, A> {
    pub fn new(tank_id: &str, transport: T, actuator: A, options: VehicleOptions) -> Self {
        let (telemetry, telemetry_rx) = TelemetryPublisher::channel(tank_id);
        let publisher = transport.publisher();

        Self {
            tank_id: tank_id.to_string(),
            topics: TankTopics::new(tank_id),
            heartbeat: HeartbeatMonitor::new(options.heartbeat_period),
            options,
            transport,
            publisher,
            pairing: PairingStateMachine::new(),
            drive: DriveTrain::new(actuator),
            turret: Turret::new(),
            telemetry,
            telemetry_rx: Some(telemetry_rx),
            emitter: None,
            subscriptions: None,
            link_errors: None,
            stats: VehicleStats::default(),
        }
    }

    pub fn tank_id(&self) -> &str {
        &self.tank_id
    }

    pub fn topics(&self) -> &TankTopics {
        &self.topics
    }

    pub fn state(&self) -> VehicleState {
        self.pairing.state()
    }

    pub fn paired_master(&self) -> Option<&str> {
        self.pairing.paired_master()
    }

    pub fn treads(&self) -> ActuatorPair {
        self.drive.treads()
    }

    pub fn turret(&self) -> Turret {
        self.turret
    }

    pub fn telemetry(&self) -> &TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    pub fn actuator(&self) -> &A {
        self.drive.actuator()
    }

    pub fn actuator_failures(&self) -> u32 {
        self.drive.actuator_failures()
    }

    pub fn failsafe_stops(&self) -> u32 {
        self.heartbeat.failsafe_stops()
    }

    pub fn stats(&self) -> VehicleStats {
        self.stats
    }

    fn last_will(&self) -> Result<BusMessage> {
        let down = TankStateMsg {
            tank_id: self.tank_id.clone(),
            state: VehicleState::Down,
        };
        Ok(BusMessage::new(self.topics.state.clone(), encode(&down)?))
    }

    async fn connect_and_subscribe(&mut self) -> Result<()> {
        let will = self.last_will()?;
        self.transport.connect(will).await?;

        let filter = self.options.controller_filter.clone();
        let subscriptions = Subscriptions {
            ask_state: self.transport.subscribe(ASK_STATE_TOPIC).await?,
            controller_state: self
                .transport
                .subscribe(&controller_state_topic(&filter))
                .await?,
            ask_pair: self.transport.subscribe(&self.topics.ask_pair).await?,
            unpair: self.transport.subscribe(&self.topics.unpair).await?,
            drive: self.transport.subscribe(&self.topics.drive).await?,
            turret_move: self.transport.subscribe(&self.topics.turret_move).await?,
            turret_fire: self.transport.subscribe(&self.topics.turret_fire).await?,
            heartbeat: self
                .transport
                .subscribe(&controller_heartbeat_topic(&filter))
                .await?,
        };
        self.subscriptions = Some(subscriptions);
        Ok(())
    }

    /// Register the last will, connect, subscribe, go Up and announce it.
    pub async fn start(&mut self) -> Result<()> {
        self.connect_and_subscribe().await?;

        if self.link_errors.is_none() {
            self.link_errors = self.transport.take_errors();
        }
        if let Some(rx) = self.telemetry_rx.take() {
            let publisher = self.transport.publisher();
            let topic = self.topics.sensors.clone();
            self.emitter = Some(tokio::spawn(run_emitter(rx, publisher, topic)));
        }

        self.pairing.bring_up();
        info!("🚜 Tank {} online", self.tank_id);
        self.announce_state().await;
        Ok(())
    }

    /// Run until `shutdown` resolves (clean exit) or the link is lost for
    /// good (error). Calls [`start`](Self::start) first if needed.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        if self.subscriptions.is_none() {
            self.start().await?;
        }

        tokio::pin!(shutdown);
        let mut ticker = self.heartbeat.ticker();

        loop {
            let Some(subs) = self.subscriptions.as_mut() else {
                return Err(TransportError::NotConnected.into());
            };
            let link_errors = &mut self.link_errors;

            let event = tokio::select! {
                _ = &mut shutdown => Event::Shutdown,
                _ = ticker.tick() => Event::Tick,
                Some(e) = next_link_error(link_errors) => Event::LinkError(e),
                m = subs.ask_state.recv() => Event::Inbound(Route::AskState, m),
                m = subs.controller_state.recv() => Event::Inbound(Route::ControllerState, m),
                m = subs.ask_pair.recv() => Event::Inbound(Route::AskPair, m),
                m = subs.unpair.recv() => Event::Inbound(Route::Unpair, m),
                m = subs.drive.recv() => Event::Inbound(Route::Drive, m),
                m = subs.turret_move.recv() => Event::Inbound(Route::TurretMove, m),
                m = subs.turret_fire.recv() => Event::Inbound(Route::TurretFire, m),
                m = subs.heartbeat.recv() => Event::Inbound(Route::Heartbeat, m),
            };

            match event {
                Event::Shutdown => {
                    info!("🛑 Shutdown requested");
                    self.shutdown().await;
                    return Ok(());
                }
                Event::Tick => {
                    self.on_heartbeat_tick().await;
                }
                Event::LinkError(e) => {
                    warn!("⚠️  Transport error: {}, reconnecting", e);
                    if let Err(e) = self.reconnect().await {
                        error!("❌ Reconnect failed: {}", e);
                        self.fail().await;
                        return Err(e);
                    }
                }
                Event::Inbound(route, Some(message)) => {
                    self.handle(route, message).await;
                }
                Event::Inbound(route, None) => {
                    error!("❌ Subscription for {:?} closed", route);
                    self.fail().await;
                    return Err(TransportError::ConnectionLost(format!(
                        "{:?} subscription closed",
                        route
                    ))
                    .into());
                }
            }
        }
    }

    /// One reconnect + resubscribe cycle.
    async fn reconnect(&mut self) -> Result<()> {
        self.stats.reconnects = self.stats.reconnects.saturating_add(1);
        self.connect_and_subscribe().await?;
        info!("🔗 Reconnected (attempt {})", self.stats.reconnects);
        self.announce_state().await;
        Ok(())
    }

    /// Dispatch one inbound message. Decode failures are logged and the
    /// message dropped.
    pub async fn handle(&mut self, route: Route, message: BusMessage) {
        self.stats.messages_handled = self.stats.messages_handled.saturating_add(1);
        debug!("📨 {:?} on {}: {}", route, message.topic, message.payload);

        let outcome = match route {
            Route::AskState => self.on_ask_state(&message).await,
            Route::ControllerState => self.on_controller_state(&message).await,
            Route::AskPair => self.on_ask_pair(&message).await,
            Route::Unpair => self.on_unpair(&message).await,
            Route::Drive => self.on_drive(&message).await,
            Route::TurretMove => self.on_turret_move(&message).await,
            Route::TurretFire => self.on_turret_fire(&message).await,
            Route::Heartbeat => self.on_heartbeat(&message),
        };

        if let Err(e) = outcome {
            self.stats.decode_errors = self.stats.decode_errors.saturating_add(1);
            warn!("Dropping message: {}", e);
        }
    }

    async fn on_ask_state(&mut self, message: &BusMessage) -> Result<()> {
        let ask: AskStateMsg = decode(&message.topic, &message.payload)?;
        debug!("State requested by {:?}", ask.controller_id);
        self.announce_state().await;
        Ok(())
    }

    async fn on_controller_state(&mut self, message: &BusMessage) -> Result<()> {
        let msg: ControllerStateMsg = decode(&message.topic, &message.payload)?;
        let controller = controller_id(&msg.controller_id, &message.topic);
        info!("🎮 Controller {} is {:?}", controller, msg.state);

        match self.pairing.controller_state(controller, msg.state) {
            ControllerReport::Alive => {
                if self.pairing.counts_as_liveness(controller) {
                    self.heartbeat.record_liveness();
                }
            }
            ControllerReport::MasterLost => self.announce_state().await,
            ControllerReport::Ignored => {}
        }
        Ok(())
    }

    async fn on_ask_pair(&mut self, message: &BusMessage) -> Result<()> {
        let msg: AskPairMsg = decode(&message.topic, &message.payload)?;
        self.check_tank_id(&msg.tank_id, &message.topic);

        let response = self.pairing.ask_pair(&msg.controller_id);
        let reply = TankPairMsg {
            tank_id: self.tank_id.clone(),
            controller_id: msg.controller_id,
            response,
        };
        publish(&self.publisher, &self.topics.pair, &reply).await;
        if response == PairResponse::Yes {
            self.announce_state().await;
        }
        Ok(())
    }

    async fn on_unpair(&mut self, message: &BusMessage) -> Result<()> {
        let msg: UnpairMsg = decode(&message.topic, &message.payload)?;
        self.check_tank_id(&msg.tank_id, &message.topic);

        if self.pairing.unpair(&msg.controller_id) {
            self.announce_state().await;
        }
        Ok(())
    }

    async fn on_drive(&mut self, message: &BusMessage) -> Result<()> {
        let msg: DriveMsg = decode(&message.topic, &message.payload)?;
        self.check_tank_id(&msg.tank_id, &message.topic);

        let treads = self.drive.apply(msg.speed, msg.direction);
        info!(
            "🚜 Drive speed={} direction={} -> left={} right={}",
            msg.speed, msg.direction, treads.left, treads.right
        );
        self.telemetry.update_left_right(treads.left, treads.right).await;
        Ok(())
    }

    async fn on_turret_move(&mut self, message: &BusMessage) -> Result<()> {
        let msg: TurretMoveMsg = decode(&message.topic, &message.payload)?;
        self.check_tank_id(&msg.tank_id, &message.topic);

        let Some(direction) = TurretDirection::parse(&msg.direction) else {
            warn!("Ignoring unknown turret direction {:?}", msg.direction);
            return Ok(());
        };

        self.turret.step(direction);
        match direction {
            TurretDirection::Left | TurretDirection::Right => {
                self.telemetry.update_turret_horizontal(self.turret.horizontal).await;
            }
            TurretDirection::Up | TurretDirection::Down => {
                self.telemetry.update_turret_vertical(self.turret.vertical).await;
            }
            TurretDirection::Center => {
                self.telemetry.update_turret_horizontal(self.turret.horizontal).await;
                self.telemetry.update_turret_vertical(self.turret.vertical).await;
            }
        }
        Ok(())
    }

    async fn on_turret_fire(&mut self, message: &BusMessage) -> Result<()> {
        let msg: TurretFireMsg = decode(&message.topic, &message.payload)?;
        self.check_tank_id(&msg.tank_id, &message.topic);

        self.turret.fire();
        self.telemetry.increment_shots_fired().await;
        Ok(())
    }

    fn on_heartbeat(&mut self, message: &BusMessage) -> Result<()> {
        let msg: HeartbeatMsg = decode(&message.topic, &message.payload)?;
        let controller = controller_id(&msg.controller_id, &message.topic);

        if self.pairing.counts_as_liveness(controller) {
            debug!("💓 Heartbeat from {}", controller);
            self.heartbeat.record_liveness();
        } else {
            debug!("Ignoring heartbeat from unpaired controller {}", controller);
        }
        Ok(())
    }

    /// Heartbeat timer expiry. Public so the failsafe can be driven
    /// without a running loop.
    pub async fn on_heartbeat_tick(&mut self) -> TickVerdict {
        let verdict = self.heartbeat.on_tick(self.drive.is_moving());
        if verdict == TickVerdict::Stop {
            warn!("🛑 STOPPING TANK: controller heartbeat lost");
            self.stop_motion().await;
        }
        verdict
    }

    async fn stop_motion(&mut self) {
        let treads = self.drive.emergency_stop();
        self.telemetry.update_left_right(treads.left, treads.right).await;
    }

    fn check_tank_id(&self, tank_id: &str, topic: &str) {
        if !tank_id.is_empty() && tank_id != self.tank_id {
            warn!("TankId {:?} on {} does not match {}, handling anyway", tank_id, topic, self.tank_id);
        }
    }

    async fn announce_state(&mut self) {
        let msg = TankStateMsg {
            tank_id: self.tank_id.clone(),
            state: self.pairing.state(),
        };
        publish(&self.publisher, &self.topics.state, &msg).await;
    }

    /// Stop, flush telemetry, go Down, announce it and release the link.
    async fn shutdown(&mut self) {
        self.stop_motion().await;
        self.telemetry.close();
        if let Some(emitter) = self.emitter.take() {
            match emitter.await {
                Ok(stats) => debug!("Telemetry emitter finished: {:?}", stats),
                Err(e) => warn!("Telemetry emitter task failed: {}", e),
            }
        }

        self.pairing.shut_down();
        self.announce_state().await;

        if let Err(e) = self.transport.disconnect().await {
            warn!("Disconnect failed: {}", e);
        }
        info!("🏁 Tank {} stopped", self.tank_id);
    }

    /// Best effort on the way out after an unrecoverable error.
    async fn fail(&mut self) {
        self.drive.emergency_stop();
        self.telemetry.close();
        if let Some(emitter) = self.emitter.take() {
            emitter.abort();
        }
        self.pairing.shut_down();
        self.announce_state().await;
    }
}

async fn publish<M: Serialize + Sync>(publisher: &Publisher, topic: &str, msg: &M) {
    let payload = match encode(msg) {
        Ok(payload) => payload,
        Err(e) => {
            error!("Failed to encode message for {}: {}", topic, e);
            return;
        }
    };

    info!("📤 {}: {}", topic, payload);
    if let Err(e) = publisher.publish(topic, payload).await {
        warn!("Failed to publish on {}: {}", topic, e);
    }
}

async fn next_link_error(
    errors: &mut Option<mpsc::Receiver<TransportError>>,
) -> Option<TransportError> {
    match errors {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// The payload's ControllerId, or the id level of a `Controller/<id>/...`
/// topic when the payload left it out.
fn controller_id<'a>(from_payload: &'a str, topic: &'a str) -> &'a str {
    if !from_payload.is_empty() {
        return from_payload;
    }
    topic.split('/').nth(1).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_id_fallback() {
        assert_eq!(controller_id("ipad", "Controller/other/State"), "ipad");
        assert_eq!(controller_id("", "Controller/ipad/Heartbeat"), "ipad");
        assert_eq!(controller_id("", "Controller"), "");
    }
}
