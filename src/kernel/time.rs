use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Virtual timestamp in milliseconds since the agent was installed.
/// Every scheduler decision is expressed against a `Tick`, never the wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Tick {
    pub ms: u64,
}

/// Driver cadence: how often the reactor checks for due harvests.
pub const TICK_MS: u64 = 100;

impl Tick {
    pub fn new() -> Self {
        Tick { ms: 0 }
    }

    pub fn from_secs(secs: u64) -> Self {
        Tick { ms: secs * 1000 }
    }

    pub fn from_elapsed(elapsed: Duration) -> Self {
        Tick { ms: elapsed.as_millis() as u64 }
    }

    pub fn after(&self, delay: Duration) -> Self {
        Tick { ms: self.ms.saturating_add(delay.as_millis() as u64) }
    }

    pub fn since(&self, earlier: Tick) -> Duration {
        Duration::from_millis(self.ms.saturating_sub(earlier.ms))
    }
}
