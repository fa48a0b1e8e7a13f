//! Physical actuation seam: "set motor N to a signed percentage".

use heapless::Deque;
use std::path::PathBuf;
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info};

pub const ACTUATOR_LIMIT: i16 = 100;
pub const HISTORY_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MotorId {
    Left = 1,
    Right = 2,
}

impl MotorId {
    pub fn number(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("motor {motor:?} value {value} outside [-100, 100]")]
    OutOfRange { motor: MotorId, value: i16 },
    #[error("failed to launch motor program {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("motor program exited with {status} for motor {motor:?}")]
    ProgramFailed { motor: MotorId, status: String },
}

pub trait Actuator: Send {
    fn set_motor(&mut self, motor: MotorId, value: i16) -> Result<(), ActuatorError>;
}

fn check_range(motor: MotorId, value: i16) -> Result<(), ActuatorError> {
    if (-ACTUATOR_LIMIT..=ACTUATOR_LIMIT).contains(&value) {
        Ok(())
    } else {
        Err(ActuatorError::OutOfRange { motor, value })
    }
}

/// Logs and records every command. Used when no hardware is attached, and
/// by the tests to observe what reached the motors.
#[derive(Debug, Default)]
pub struct LogActuator {
    history: Deque<(MotorId, i16), HISTORY_CAPACITY>,
    fail_next: u32,
}

impl LogActuator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent commands, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &(MotorId, i16)> {
        self.history.iter()
    }

    pub fn last(&self, motor: MotorId) -> Option<i16> {
        self.history
            .iter()
            .rev()
            .find(|(m, _)| *m == motor)
            .map(|(_, v)| *v)
    }

    /// Make the next `count` commands fail as a dead motor driver would.
    pub fn fail_next(&mut self, count: u32) {
        self.fail_next = count;
    }
}

impl Actuator for LogActuator {
    fn set_motor(&mut self, motor: MotorId, value: i16) -> Result<(), ActuatorError> {
        check_range(motor, value)?;

        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(ActuatorError::ProgramFailed {
                motor,
                status: "simulated failure".into(),
            });
        }

        if self.history.is_full() {
            self.history.pop_front();
        }
        // Cannot fail: a slot was just freed
        let _ = self.history.push_back((motor, value));
        debug!("⚙️  Motor {} set to {}", motor.number(), value);
        Ok(())
    }
}

/// Drives the motors through an external program invoked as
/// `<program> 0 <motor> <value * 100>`.
#[derive(Debug, Clone)]
pub struct CommandActuator {
    program: PathBuf,
}

impl CommandActuator {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        info!("⚙️  Using motor program {}", program.display());
        Self { program }
    }

    pub fn program_args(motor: MotorId, value: i16) -> [String; 3] {
        [
            "0".to_string(),
            motor.number().to_string(),
            (i32::from(value) * 100).to_string(),
        ]
    }
}

impl Actuator for CommandActuator {
    fn set_motor(&mut self, motor: MotorId, value: i16) -> Result<(), ActuatorError> {
        check_range(motor, value)?;

        let status = Command::new(&self.program)
            .args(Self::program_args(motor, value))
            .status()
            .map_err(|source| ActuatorError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(ActuatorError::ProgramFailed {
                motor,
                status: status.to_string(),
            })
        }
    }
}
