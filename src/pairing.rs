//! Vehicle state and exclusive controller pairing.
//!
//! ```text
//! Down --bring_up--> Up --ask_pair--> Paired
//!                     ^                  |
//!                     +-- unpair / master Down
//! ```
//!
//! `shut_down` moves to Down from anywhere and Down is then terminal.

use crate::protocol::{ControllerState, PairResponse, VehicleState};
use arrayvec::ArrayString;
use tracing::{info, warn};

pub const MAX_CONTROLLER_ID_LEN: usize = 64;

pub type ControllerId = ArrayString<MAX_CONTROLLER_ID_LEN>;

/// What a `Controller/<id>/State` report meant to the vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerReport {
    /// The controller reported Up; feeds the heartbeat monitor.
    Alive,
    /// The paired master left Up and the pairing was released.
    MasterLost,
    /// Not Up, from a controller we are not paired with.
    Ignored,
}

#[derive(Debug)]
pub struct PairingStateMachine {
    state: VehicleState,
    paired_master: Option<ControllerId>,
    shut_down: bool,
}

impl Default for PairingStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PairingStateMachine {
    pub fn new() -> Self {
        Self {
            state: VehicleState::Down,
            paired_master: None,
            shut_down: false,
        }
    }

    pub fn state(&self) -> VehicleState {
        self.state
    }

    pub fn paired_master(&self) -> Option<&str> {
        self.paired_master.as_ref().map(|id| id.as_str())
    }

    pub fn is_master(&self, controller_id: &str) -> bool {
        self.paired_master() == Some(controller_id)
    }

    /// Transport is ready. Returns false once shut down.
    pub fn bring_up(&mut self) -> bool {
        if self.shut_down {
            return false;
        }
        if self.state == VehicleState::Down {
            self.state = VehicleState::Up;
            info!("🟢 Vehicle is Up");
        }
        true
    }

    pub fn ask_pair(&mut self, controller_id: &str) -> PairResponse {
        if self.state != VehicleState::Up {
            info!("🔒 Refusing pair request from {} while {:?}", controller_id, self.state);
            return PairResponse::No;
        }
        if controller_id.is_empty() {
            warn!("Refusing pair request with empty controller id");
            return PairResponse::No;
        }

        let Ok(id) = ControllerId::from(controller_id) else {
            warn!(
                "Refusing pair request: controller id longer than {} bytes",
                MAX_CONTROLLER_ID_LEN
            );
            return PairResponse::No;
        };

        self.paired_master = Some(id);
        self.state = VehicleState::Paired;
        info!("🤝 Paired with {}", controller_id);
        PairResponse::Yes
    }

    /// Only `Up` is a sign of life. Any other state from the paired master
    /// means it is no longer driving us, so the pairing is released.
    pub fn controller_state(&mut self, controller_id: &str, state: ControllerState) -> ControllerReport {
        if state == ControllerState::Up {
            return ControllerReport::Alive;
        }

        if self.state == VehicleState::Paired && self.is_master(controller_id) {
            self.release();
            warn!("📴 Paired controller {} is {:?}, pairing released", controller_id, state);
            ControllerReport::MasterLost
        } else {
            ControllerReport::Ignored
        }
    }

    /// Returns true when the pairing was released.
    pub fn unpair(&mut self, controller_id: &str) -> bool {
        if self.state == VehicleState::Paired && self.is_master(controller_id) {
            self.release();
            info!("👋 Unpaired from {}", controller_id);
            return true;
        }

        warn!(
            "Ignoring unpair from {} (paired master: {:?})",
            controller_id,
            self.paired_master()
        );
        false
    }

    /// While paired only the master keeps the vehicle alive; otherwise any
    /// controller does.
    pub fn counts_as_liveness(&self, controller_id: &str) -> bool {
        self.state != VehicleState::Paired || self.is_master(controller_id)
    }

    pub fn shut_down(&mut self) {
        self.shut_down = true;
        self.paired_master = None;
        self.state = VehicleState::Down;
        info!("🔴 Vehicle is Down");
    }

    fn release(&mut self) {
        self.paired_master = None;
        self.state = VehicleState::Up;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn up() -> PairingStateMachine {
        let mut pairing = PairingStateMachine::new();
        assert!(pairing.bring_up());
        pairing
    }

    #[test]
    fn test_starts_down_and_refuses_pairing() {
        let mut pairing = PairingStateMachine::new();
        assert_eq!(pairing.state(), VehicleState::Down);
        assert_eq!(pairing.ask_pair("c1"), PairResponse::No);
        assert_eq!(pairing.paired_master(), None);
    }

    #[test]
    fn test_first_pair_wins() {
        let mut pairing = up();
        assert_eq!(pairing.ask_pair("c1"), PairResponse::Yes);
        assert_eq!(pairing.ask_pair("c2"), PairResponse::No);
        // Even the master cannot pair twice
        assert_eq!(pairing.ask_pair("c1"), PairResponse::No);
        assert_eq!(pairing.paired_master(), Some("c1"));
    }

    #[test]
    fn test_oversized_or_empty_id_refused() {
        let mut pairing = up();
        let long = "c".repeat(MAX_CONTROLLER_ID_LEN + 1);
        assert_eq!(pairing.ask_pair(&long), PairResponse::No);
        assert_eq!(pairing.ask_pair(""), PairResponse::No);
        assert_eq!(pairing.state(), VehicleState::Up);
    }

    #[test]
    fn test_master_down_releases() {
        let mut pairing = up();
        pairing.ask_pair("c1");

        assert_eq!(pairing.controller_state("c2", ControllerState::Down), ControllerReport::Ignored);
        assert_eq!(pairing.state(), VehicleState::Paired);

        assert_eq!(pairing.controller_state("c1", ControllerState::Up), ControllerReport::Alive);
        assert_eq!(pairing.state(), VehicleState::Paired);

        assert_eq!(pairing.controller_state("c1", ControllerState::Down), ControllerReport::MasterLost);
        assert_eq!(pairing.state(), VehicleState::Up);
        assert_eq!(pairing.paired_master(), None);
    }

    #[test]
    fn test_master_leaving_up_releases() {
        for state in [ControllerState::Pairing, ControllerState::Paired] {
            let mut pairing = up();
            pairing.ask_pair("c1");

            assert_eq!(pairing.controller_state("c2", state), ControllerReport::Ignored);
            assert_eq!(pairing.paired_master(), Some("c1"));

            assert_eq!(pairing.controller_state("c1", state), ControllerReport::MasterLost);
            assert_eq!(pairing.state(), VehicleState::Up);
            assert_eq!(pairing.paired_master(), None);
        }
    }

    #[test]
    fn test_only_up_is_alive() {
        let mut pairing = up();
        assert_eq!(pairing.controller_state("c1", ControllerState::Up), ControllerReport::Alive);
        assert_eq!(pairing.controller_state("c1", ControllerState::Pairing), ControllerReport::Ignored);
        assert_eq!(pairing.controller_state("c1", ControllerState::Paired), ControllerReport::Ignored);
        assert_eq!(pairing.state(), VehicleState::Up);
    }

    #[test]
    fn test_unpair_only_from_master() {
        let mut pairing = up();
        assert!(!pairing.unpair("c1"));

        pairing.ask_pair("c1");
        assert!(!pairing.unpair("c2"));
        assert_eq!(pairing.state(), VehicleState::Paired);

        assert!(pairing.unpair("c1"));
        assert_eq!(pairing.state(), VehicleState::Up);
        assert_eq!(pairing.ask_pair("c2"), PairResponse::Yes);
    }

    #[test]
    fn test_liveness_filter() {
        let mut pairing = up();
        assert!(pairing.counts_as_liveness("anyone"));
        pairing.ask_pair("c1");
        assert!(pairing.counts_as_liveness("c1"));
        assert!(!pairing.counts_as_liveness("c2"));
    }

    #[test]
    fn test_down_is_terminal() {
        let mut pairing = up();
        pairing.ask_pair("c1");
        pairing.shut_down();
        assert_eq!(pairing.state(), VehicleState::Down);
        assert!(!pairing.bring_up());
        assert_eq!(pairing.ask_pair("c1"), PairResponse::No);
    }
}
