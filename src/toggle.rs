//! Debounced toggle state
//!
//! Press-to-toggle semantics for momentary buttons. A press inside the
//! debounce window (switch bounce, duplicate delivery) is absorbed. Group
//! exclusivity is the mapper's job; a toggle knows nothing about its peers.

use std::time::{Duration, Instant};

/// Default minimum interval between accepted transitions
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);

/// Per-button on/off state with debounce
#[derive(Debug, Clone)]
pub struct Toggle {
    on: bool,
    debounce: Duration,
    last_transition: Option<Instant>,
}

impl Toggle {
    pub fn new(initial: bool, debounce: Duration) -> Self {
        Self {
            on: initial,
            debounce,
            last_transition: None,
        }
    }

    pub fn current(&self) -> bool {
        self.on
    }

    /// Set the value directly (startup seeding from a monitor read)
    pub fn seed(&mut self, on: bool) {
        self.on = on;
    }

    /// Register a press at `at`. Returns whether the state flipped; presses
    /// inside the debounce window are ignored.
    pub fn press(&mut self, at: Instant) -> bool {
        if let Some(last) = self.last_transition {
            if at.duration_since(last) < self.debounce {
                return false;
            }
        }
        self.on = !self.on;
        self.last_transition = Some(at);
        true
    }

    /// Force the toggle off (exclusivity-group eviction). Not a press, so the
    /// debounce window does not apply; the transition timestamp is recorded.
    pub fn force_off(&mut self, at: Instant) -> bool {
        if !self.on {
            return false;
        }
        self.on = false;
        self.last_transition = Some(at);
        true
    }
}
