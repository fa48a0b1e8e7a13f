//! Drive conversion and the tread/turret actuation state built on it.

use crate::actuator::{Actuator, MotorId, ACTUATOR_LIMIT};
use static_assertions::const_assert;
use tracing::{info, warn};

/// Turret travel per `TurretMove` command.
pub const TURRET_STEP: i16 = 5;

const_assert!(TURRET_STEP > 0);
const_assert!(TURRET_STEP <= ACTUATOR_LIMIT);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActuatorPair {
    pub left: i16,
    pub right: i16,
}

impl ActuatorPair {
    pub const STOP: ActuatorPair = ActuatorPair { left: 0, right: 0 };

    pub fn is_moving(&self) -> bool {
        self.left != 0 || self.right != 0
    }
}

fn clamp(value: i32) -> i16 {
    let limit = i32::from(ACTUATOR_LIMIT);
    // In range after the clamp
    value.clamp(-limit, limit) as i16
}

/// Mix a (speed, direction) command into tread percentages.
///
/// `direction` adds to the left tread when moving forward or turning in
/// place, and subtracts from it when reversing. The right tread is derived
/// from the already clamped left.
pub fn convert(speed: i16, direction: i16) -> ActuatorPair {
    let speed = i32::from(speed);
    let direction = i32::from(direction);
    let multiplier = if speed == 0 { 1 } else { speed.signum() };

    let left = clamp(speed + multiplier * direction);
    let right = clamp(2 * speed - i32::from(left));
    ActuatorPair { left, right }
}

/// Owns the tread motors. Remembers the last command whether or not the
/// hardware accepted it, so the failsafe still sees the vehicle as moving
/// after a flaky write.
pub struct DriveTrain<A: Actuator> {
    actuator: A,
    speed: i16,
    direction: i16,
    treads: ActuatorPair,
    actuator_failures: u32,
}

impl<A: Actuator> DriveTrain<A> {
    pub fn new(actuator: A) -> Self {
        Self {
            actuator,
            speed: 0,
            direction: 0,
            treads: ActuatorPair::STOP,
            actuator_failures: 0,
        }
    }

    pub fn apply(&mut self, speed: i16, direction: i16) -> ActuatorPair {
        let treads = convert(speed, direction);
        self.speed = speed;
        self.direction = direction;
        self.treads = treads;

        for (motor, value) in [(MotorId::Left, treads.left), (MotorId::Right, treads.right)] {
            if let Err(e) = self.actuator.set_motor(motor, value) {
                self.actuator_failures = self.actuator_failures.saturating_add(1);
                warn!("⚠️  Actuator failure ({} total): {}", self.actuator_failures, e);
            }
        }

        treads
    }

    pub fn emergency_stop(&mut self) -> ActuatorPair {
        warn!("🛑 Emergency stop");
        self.apply(0, 0)
    }

    pub fn is_moving(&self) -> bool {
        self.treads.is_moving()
    }

    pub fn treads(&self) -> ActuatorPair {
        self.treads
    }

    pub fn command(&self) -> (i16, i16) {
        (self.speed, self.direction)
    }

    pub fn actuator_failures(&self) -> u32 {
        self.actuator_failures
    }

    pub fn actuator(&self) -> &A {
        &self.actuator
    }

    pub fn actuator_mut(&mut self) -> &mut A {
        &mut self.actuator
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurretDirection {
    Left,
    Right,
    Up,
    Down,
    Center,
}

impl TurretDirection {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        [
            ("left", TurretDirection::Left),
            ("right", TurretDirection::Right),
            ("up", TurretDirection::Up),
            ("down", TurretDirection::Down),
            ("center", TurretDirection::Center),
        ]
        .into_iter()
        .find(|(name, _)| raw.eq_ignore_ascii_case(name))
        .map(|(_, direction)| direction)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Turret {
    pub horizontal: i16,
    pub vertical: i16,
    pub shots_fired: u32,
}

impl Turret {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(&mut self, direction: TurretDirection) {
        match direction {
            TurretDirection::Left => self.horizontal = self.horizontal.saturating_sub(TURRET_STEP),
            TurretDirection::Right => self.horizontal = self.horizontal.saturating_add(TURRET_STEP),
            TurretDirection::Up => self.vertical = self.vertical.saturating_add(TURRET_STEP),
            TurretDirection::Down => self.vertical = self.vertical.saturating_sub(TURRET_STEP),
            TurretDirection::Center => {
                self.horizontal = 0;
                self.vertical = 0;
            }
        }
        info!("🎯 Turret {:?}: h={} v={}", direction, self.horizontal, self.vertical);
    }

    pub fn fire(&mut self) -> u32 {
        self.shots_fired = self.shots_fired.saturating_add(1);
        info!("💥 Turret fired ({} total)", self.shots_fired);
        self.shots_fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::LogActuator;

    #[test]
    fn test_convert_examples() {
        assert_eq!(convert(50, 20), ActuatorPair { left: 70, right: 30 });
        assert_eq!(convert(-50, 20), ActuatorPair { left: -70, right: -30 });
        assert_eq!(convert(0, 30), ActuatorPair { left: 30, right: -30 });
        assert_eq!(convert(100, 50), ActuatorPair { left: 100, right: 100 });
        assert_eq!(convert(0, 0), ActuatorPair::STOP);
    }

    #[test]
    fn test_convert_extremes_do_not_overflow() {
        let pair = convert(i16::MAX, i16::MAX);
        assert_eq!(pair, ActuatorPair { left: 100, right: 100 });

        let pair = convert(i16::MIN, i16::MAX);
        assert_eq!(pair, ActuatorPair { left: -100, right: -100 });
    }

    #[test]
    fn test_apply_drives_both_motors() {
        let mut drive = DriveTrain::new(LogActuator::new());
        drive.apply(50, 20);
        assert_eq!(drive.actuator().last(MotorId::Left), Some(70));
        assert_eq!(drive.actuator().last(MotorId::Right), Some(30));
        assert!(drive.is_moving());

        drive.emergency_stop();
        assert!(!drive.is_moving());
        assert_eq!(drive.command(), (0, 0));
    }

    #[test]
    fn test_actuator_failures_are_counted() {
        let mut drive = DriveTrain::new(LogActuator::new());
        drive.actuator_mut().fail_next(1);
        let treads = drive.apply(40, 0);

        assert_eq!(treads, ActuatorPair { left: 40, right: 40 });
        assert_eq!(drive.actuator_failures(), 1);
        assert!(drive.is_moving());
        assert_eq!(drive.actuator().last(MotorId::Right), Some(40));
    }

    #[test]
    fn test_turret_directions() {
        assert_eq!(TurretDirection::parse("LEFT"), Some(TurretDirection::Left));
        assert_eq!(TurretDirection::parse(" center "), Some(TurretDirection::Center));
        assert_eq!(TurretDirection::parse("sideways"), None);

        let mut turret = Turret::new();
        turret.step(TurretDirection::Left);
        turret.step(TurretDirection::Up);
        turret.step(TurretDirection::Up);
        assert_eq!((turret.horizontal, turret.vertical), (-TURRET_STEP, 2 * TURRET_STEP));

        turret.step(TurretDirection::Center);
        assert_eq!((turret.horizontal, turret.vertical), (0, 0));
        assert_eq!(turret.fire(), 1);
    }
}
