use crate::actuator::ActuatorError;
use crate::config::ConfigError;
use crate::identity::IdentityError;
use crate::protocol::ProtocolError;
use crate::transport::TransportError;
use thiserror::Error;

/// Crate-wide error. Every subsystem error folds into this so the binaries
/// can decide between "log and keep going" and "exit non-zero".
#[derive(Debug, Error)]
pub enum TankError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("actuator error: {0}")]
    Actuator(#[from] ActuatorError),
    #[error("identity bootstrap failed: {0}")]
    Identity(#[from] IdentityError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl TankError {
    /// Bad messages and flaky motors are survivable. Everything else takes
    /// the vehicle offline.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TankError::Protocol(_) | TankError::Actuator(_))
    }
}

pub type Result<T> = core::result::Result<T, TankError>;
