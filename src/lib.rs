//! # Tank Bus
//!
//! Control core for a remotely driven tank. The vehicle announces itself on
//! a publish/subscribe bus, pairs exclusively with one controller, turns
//! drive and turret commands into motor settings and telemetry, and stops
//! the treads when the controller's heartbeat goes quiet.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tankbus::actuator::LogActuator;
//! use tankbus::bus::Broker;
//! use tankbus::transport::MemoryTransport;
//! use tankbus::vehicle::{Vehicle, VehicleOptions};
//!
//! # async fn demo() -> tankbus::Result<()> {
//! let broker = Broker::new();
//! let transport = MemoryTransport::new(broker.clone(), "tank-1");
//! let mut vehicle = Vehicle::new("tank-1", transport, LogActuator::new(), VehicleOptions::default());
//!
//! vehicle.run(async {
//!     let _ = tokio::signal::ctrl_c().await;
//! }).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`vehicle`] - Event loop and message routing
//! - [`pairing`] - Vehicle state and controller pairing
//! - [`drive`] - Speed/direction to tread conversion, turret state
//! - [`heartbeat`] - Controller liveness failsafe
//! - [`telemetry`] - Sensor snapshot and its emitter
//! - [`protocol`] - Topics and JSON payloads
//! - [`transport`] / [`bus`] - Pub/sub seam, in-process broker, TCP client
//! - [`actuator`] - Motor output

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod actuator;
pub mod bus;
pub mod config;
pub mod drive;
pub mod error;
pub mod heartbeat;
pub mod identity;
pub mod pairing;
pub mod protocol;
pub mod telemetry;
pub mod transport;
pub mod vehicle;

// Re-export main public types for convenience
pub use error::{Result, TankError};
pub use protocol::{ControllerState, PairResponse, TankTopics, VehicleState};
pub use vehicle::{Vehicle, VehicleOptions};
