//! Wire protocol: topic layout and the JSON records exchanged with
//! controllers.
//!
//! Field names are PascalCase on the wire and must stay that way; existing
//! controllers match on them exactly. Inbound records tolerate missing
//! fields (they decode to zero values), outbound records are always
//! complete.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_PAYLOAD_SIZE: usize = 512;

pub const ASK_STATE_TOPIC: &str = "Tank/AskState";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VehicleState {
    Down,
    Up,
    Paired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ControllerState {
    #[default]
    Down,
    Up,
    Pairing,
    Paired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairResponse {
    Yes,
    No,
}

// Published by the tank.

/// `Tank/<id>/State`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TankStateMsg {
    pub tank_id: String,
    pub state: VehicleState,
}

/// `Tank/<id>/Pair`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TankPairMsg {
    pub tank_id: String,
    pub controller_id: String,
    pub response: PairResponse,
}

// Subscribed to by the tank.

/// `Tank/AskState`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AskStateMsg {
    pub controller_id: String,
}

/// `Controller/<id>/State`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ControllerStateMsg {
    pub controller_id: String,
    pub state: ControllerState,
}

/// `Tank/<id>/AskPair`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AskPairMsg {
    pub controller_id: String,
    pub tank_id: String,
}

/// `Tank/<id>/Unpair`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UnpairMsg {
    pub controller_id: String,
    pub tank_id: String,
}

/// `Tank/<id>/Drive`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DriveMsg {
    pub controller_id: String,
    pub tank_id: String,
    pub speed: i16,
    pub direction: i16,
}

/// `Tank/<id>/TurretMove`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TurretMoveMsg {
    pub controller_id: String,
    pub tank_id: String,
    pub direction: String,
}

/// `Tank/<id>/TurretFire`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TurretFireMsg {
    pub controller_id: String,
    pub tank_id: String,
}

/// `Controller/<id>/Heartbeat`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HeartbeatMsg {
    pub controller_id: String,
}

/// Every topic name derived from the tank id, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TankTopics {
    pub state: String,
    pub pair: String,
    pub sensors: String,
    pub ask_pair: String,
    pub unpair: String,
    pub drive: String,
    pub turret_move: String,
    pub turret_fire: String,
}

impl TankTopics {
    pub fn new(tank_id: &str) -> Self {
        let topic = |leaf: &str| format!("Tank/{}/{}", tank_id, leaf);
        Self {
            state: topic("State"),
            pair: topic("Pair"),
            sensors: topic("Sensors"),
            ask_pair: topic("AskPair"),
            unpair: topic("Unpair"),
            drive: topic("Drive"),
            turret_move: topic("TurretMove"),
            turret_fire: topic("TurretFire"),
        }
    }
}

/// `Controller/<filter>/State`, where `filter` is a controller id or `+`.
pub fn controller_state_topic(controller: &str) -> String {
    format!("Controller/{}/State", controller)
}

/// `Controller/<filter>/Heartbeat`, where `filter` is a controller id or `+`.
pub fn controller_heartbeat_topic(controller: &str) -> String {
    format!("Controller/{}/Heartbeat", controller)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("payload of {size} bytes exceeds {MAX_PAYLOAD_SIZE} byte limit")]
    MessageTooLarge { size: usize },
    #[error("invalid payload on {topic}: {reason}")]
    InvalidJson { topic: String, reason: String },
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Decode one inbound record. Failures are per-message and never fatal.
pub fn decode<T: DeserializeOwned>(topic: &str, payload: &str) -> Result<T, ProtocolError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::MessageTooLarge { size: payload.len() });
    }

    serde_json::from_str::<T>(payload).map_err(|e| ProtocolError::InvalidJson {
        topic: topic.to_string(),
        reason: e.to_string(),
    })
}

pub fn encode<T: Serialize>(msg: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(msg).map_err(|e| ProtocolError::Serialization(e.to_string()))
}
