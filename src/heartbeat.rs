//! Controller liveness watchdog.
//!
//! Level-triggered: each tick asks "was anything heard since the last
//! tick?". A silent period while the treads are turning means the vehicle
//! must stop. The flag is cleared on every tick regardless of the outcome.

use std::time::Duration;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, warn};

pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickVerdict {
    Alive,
    /// Silent, but nothing to stop.
    SilentIdle,
    /// Silent while moving: stop the treads.
    Stop,
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    period: Duration,
    seen_since_last_tick: bool,
    failsafe_stops: u32,
}

impl HeartbeatMonitor {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            seen_since_last_tick: true,
            failsafe_stops: 0,
        }
    }

    /// Timer whose first tick lands one full period after creation.
    pub fn ticker(&self) -> Interval {
        let mut ticker = time::interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    pub fn record_liveness(&mut self) {
        self.seen_since_last_tick = true;
    }

    pub fn seen_since_last_tick(&self) -> bool {
        self.seen_since_last_tick
    }

    pub fn on_tick(&mut self, moving: bool) -> TickVerdict {
        let seen = core::mem::replace(&mut self.seen_since_last_tick, false);

        if seen {
            debug!("💓 Controller alive");
            TickVerdict::Alive
        } else if moving {
            self.failsafe_stops = self.failsafe_stops.saturating_add(1);
            warn!("💔 No controller heartbeat for {:?} while moving", self.period);
            TickVerdict::Stop
        } else {
            TickVerdict::SilentIdle
        }
    }

    pub fn failsafe_stops(&self) -> u32 {
        self.failsafe_stops
    }
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_PERIOD)
    }
}
