//! Sensor telemetry: the latest motion/turret/shot snapshot and the worker
//! that publishes it on `Tank/<id>/Sensors`.
//!
//! The vehicle loop mutates the snapshot through [`TelemetryPublisher`];
//! every mutation hands a full copy to the emitter and waits until the
//! emitter has finished publishing it. At most one snapshot is in flight.

use crate::protocol::encode;
use crate::transport::Publisher;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub const TELEMETRY_CHANNEL_CAPACITY: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DirectionFr {
    #[default]
    Forward,
    Reverse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DirectionLr {
    Left,
    Right,
    #[default]
    Straight,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TelemetrySnapshot {
    pub tank_id: String,
    pub left_tread: i16,
    pub right_tread: i16,
    pub speed: i16,
    #[serde(rename = "DirectionFR")]
    pub direction_fr: DirectionFr,
    #[serde(rename = "DirectionLR")]
    pub direction_lr: DirectionLr,
    pub turret_horizontal: i16,
    pub turret_vertical: i16,
    pub shots_fired: u32,
}

impl TelemetrySnapshot {
    pub fn new(tank_id: &str) -> Self {
        Self {
            tank_id: tank_id.to_string(),
            left_tread: 0,
            right_tread: 0,
            speed: 0,
            direction_fr: DirectionFr::Forward,
            direction_lr: DirectionLr::Straight,
            turret_horizontal: 0,
            turret_vertical: 0,
            shots_fired: 0,
        }
    }
}

/// Derive (Speed, DirectionFR, DirectionLR) from a tread pair.
pub fn motion_labels(left: i16, right: i16) -> (i16, DirectionFr, DirectionLr) {
    // Truncating division; the mean of two i16 always fits
    let speed = ((i32::from(left) + i32::from(right)) / 2) as i16;

    let fr = if speed >= 0 {
        DirectionFr::Forward
    } else {
        DirectionFr::Reverse
    };

    let lr = if speed == 0 || left == right {
        DirectionLr::Straight
    } else if (left > right) == (speed > 0) {
        DirectionLr::Right
    } else {
        DirectionLr::Left
    };

    (speed, fr, lr)
}

/// A snapshot handed to the emitter. `published` fires once it is out.
#[derive(Debug)]
pub struct Emission {
    pub snapshot: TelemetrySnapshot,
    published: oneshot::Sender<()>,
}

pub struct TelemetryPublisher {
    snapshot: TelemetrySnapshot,
    tx: Option<mpsc::Sender<Emission>>,
    dropped: u32,
}

impl TelemetryPublisher {
    pub fn new(tank_id: &str, tx: mpsc::Sender<Emission>) -> Self {
        Self {
            snapshot: TelemetrySnapshot::new(tank_id),
            tx: Some(tx),
            dropped: 0,
        }
    }

    /// Publisher plus the receiving end to hand to [`run_emitter`].
    pub fn channel(tank_id: &str) -> (Self, mpsc::Receiver<Emission>) {
        let (tx, rx) = mpsc::channel(TELEMETRY_CHANNEL_CAPACITY);
        (Self::new(tank_id, tx), rx)
    }

    pub fn snapshot(&self) -> &TelemetrySnapshot {
        &self.snapshot
    }

    /// Release the emitter: it drains what it already holds and returns.
    /// Later mutations still update the snapshot but are not emitted.
    pub fn close(&mut self) {
        self.tx = None;
    }

    /// Snapshots that could not be handed over because the emitter is gone.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    pub async fn update_left_right(&mut self, left: i16, right: i16) {
        let (speed, fr, lr) = motion_labels(left, right);
        self.snapshot.left_tread = left;
        self.snapshot.right_tread = right;
        self.snapshot.speed = speed;
        self.snapshot.direction_fr = fr;
        self.snapshot.direction_lr = lr;
        self.emit().await;
    }

    pub async fn update_turret_horizontal(&mut self, value: i16) {
        self.snapshot.turret_horizontal = value;
        self.emit().await;
    }

    pub async fn update_turret_vertical(&mut self, value: i16) {
        self.snapshot.turret_vertical = value;
        self.emit().await;
    }

    pub async fn increment_shots_fired(&mut self) {
        self.snapshot.shots_fired = self.snapshot.shots_fired.saturating_add(1);
        self.emit().await;
    }

    async fn emit(&mut self) {
        let delivered = match &self.tx {
            Some(tx) => {
                let (published, done) = oneshot::channel();
                let emission = Emission {
                    snapshot: self.snapshot.clone(),
                    published,
                };
                tx.send(emission).await.is_ok() && done.await.is_ok()
            }
            None => false,
        };
        if !delivered {
            self.dropped = self.dropped.saturating_add(1);
            warn!("Telemetry emitter stopped, snapshot dropped");
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitterStats {
    pub published: u32,
    pub failed: u32,
}

/// Publish every snapshot received until the channel closes, acknowledging
/// each one after the publish attempt.
pub async fn run_emitter(
    mut rx: mpsc::Receiver<Emission>,
    publisher: Publisher,
    topic: String,
) -> EmitterStats {
    let mut stats = EmitterStats::default();
    info!("📡 Telemetry emitter publishing on {}", topic);

    while let Some(Emission { snapshot, published }) = rx.recv().await {
        match encode(&snapshot) {
            Ok(payload) => match publisher.publish(&topic, payload).await {
                Ok(()) => {
                    stats.published += 1;
                    debug!("📡 TELEMETRY: {:?}", snapshot);
                }
                Err(e) => {
                    stats.failed += 1;
                    warn!("Failed to publish telemetry: {}", e);
                }
            },
            Err(e) => {
                stats.failed += 1;
                warn!("Failed to encode telemetry: {}", e);
            }
        }
        let _ = published.send(());
    }

    info!(
        "📡 Telemetry emitter stopped ({} published, {} failed)",
        stats.published, stats.failed
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Publish, TransportError};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    #[test]
    fn test_motion_labels() {
        assert_eq!(motion_labels(70, 30), (50, DirectionFr::Forward, DirectionLr::Right));
        assert_eq!(motion_labels(30, 70), (50, DirectionFr::Forward, DirectionLr::Left));
        // Inverted when reversing
        assert_eq!(motion_labels(-70, -30), (-50, DirectionFr::Reverse, DirectionLr::Right));
        assert_eq!(motion_labels(-30, -70), (-50, DirectionFr::Reverse, DirectionLr::Left));
        assert_eq!(motion_labels(40, 40), (40, DirectionFr::Forward, DirectionLr::Straight));
        assert_eq!(motion_labels(50, -50), (0, DirectionFr::Forward, DirectionLr::Straight));
        // -1 / 2 truncates to 0
        assert_eq!(motion_labels(0, -1), (0, DirectionFr::Forward, DirectionLr::Straight));
    }

    #[test]
    fn test_snapshot_wire_names() {
        let json = encode(&TelemetrySnapshot::new("t1")).unwrap();
        assert_eq!(
            json,
            r#"{"TankId":"t1","LeftTread":0,"RightTread":0,"Speed":0,"DirectionFR":"Forward","DirectionLR":"Straight","TurretHorizontal":0,"TurretVertical":0,"ShotsFired":0}"#
        );
    }

    #[tokio::test]
    async fn test_every_mutator_emits_once() {
        let (mut telemetry, mut rx) = TelemetryPublisher::channel("t1");

        let consumer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(emission) = rx.recv().await {
                seen.push(emission.snapshot);
                let _ = emission.published.send(());
            }
            seen
        });

        telemetry.update_left_right(70, 30).await;
        telemetry.update_turret_horizontal(-5).await;
        telemetry.update_turret_vertical(5).await;
        telemetry.increment_shots_fired().await;
        let telemetry_dropped = telemetry.dropped();
        drop(telemetry);

        let seen = consumer.await.unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(telemetry_dropped, 0);
        assert_eq!(seen[0].speed, 50);
        assert_eq!(seen[1].turret_horizontal, -5);
        assert_eq!(seen[3].shots_fired, 1);
        assert_eq!(seen[3].left_tread, 70);
    }

    /// Publishes only as permits are handed out.
    struct GatedPublisher {
        gate: Arc<Semaphore>,
        payloads: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Publish for GatedPublisher {
        async fn publish(&self, _topic: &str, payload: String) -> Result<(), TransportError> {
            self.gate
                .acquire()
                .await
                .map_err(|_| TransportError::NotConnected)?
                .forget();
            self.payloads.lock().unwrap().push(payload);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutator_waits_until_published() {
        let (mut telemetry, rx) = TelemetryPublisher::channel("t1");
        let gate = Arc::new(Semaphore::new(0));
        let payloads = Arc::new(Mutex::new(Vec::new()));
        let publisher: Publisher = Arc::new(GatedPublisher {
            gate: Arc::clone(&gate),
            payloads: Arc::clone(&payloads),
        });
        let emitter = tokio::spawn(run_emitter(rx, publisher, "Tank/t1/Sensors".into()));

        // The emitter has the snapshot but cannot publish it yet
        let stalled =
            tokio::time::timeout(Duration::from_secs(1), telemetry.update_left_right(10, 10)).await;
        assert!(stalled.is_err());
        assert!(payloads.lock().unwrap().is_empty());

        gate.add_permits(2);
        telemetry.increment_shots_fired().await;
        assert_eq!(payloads.lock().unwrap().len(), 2);

        telemetry.close();
        let stats = emitter.await.unwrap();
        assert_eq!(stats.published, 2);
    }

    #[tokio::test]
    async fn test_closed_emitter_counts_drops() {
        let (mut telemetry, rx) = TelemetryPublisher::channel("t1");
        drop(rx);
        telemetry.increment_shots_fired().await;
        assert_eq!(telemetry.dropped(), 1);
        assert_eq!(telemetry.snapshot().shots_fired, 1);
    }
}
