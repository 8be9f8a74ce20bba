//! Virtual knob state
//!
//! Decouples the monitor-facing value from the physical control's raw signal:
//! encoder wrap, mode-switch jumps, and over-spinning never leave the
//! configured domain. Pure state transformation, no I/O.

use std::time::Instant;

/// Smoothed, clamped per-control value independent of the physical knob
#[derive(Debug, Clone)]
pub struct VirtualKnob {
    name: String,
    value: u16,
    min: u16,
    max: u16,
    /// Timestamp of the last event that touched this knob
    pub last_event: Option<Instant>,
}

impl VirtualKnob {
    /// Create a knob at `initial`, clamped into `[min, max]`
    pub fn new(name: impl Into<String>, initial: u16, min: u16, max: u16) -> Self {
        debug_assert!(min < max);
        Self {
            name: name.into(),
            value: initial.clamp(min, max),
            min,
            max,
            last_event: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current virtual value, always within `[min, max]`
    pub fn current(&self) -> u16 {
        self.value
    }

    /// Set the value directly (startup seeding from a monitor read)
    pub fn seed(&mut self, value: u16) -> u16 {
        self.value = value.clamp(self.min, self.max);
        self.value
    }

    /// Apply an absolute 7-bit position, rescaled into the domain.
    ///
    /// Prior relative deltas leave no residual effect: the result depends on
    /// `raw` alone.
    pub fn apply_absolute(&mut self, raw: u8, at: Instant) -> u16 {
        let raw = raw.min(127) as u32;
        let span = (self.max - self.min) as u32;
        // Round-to-nearest so raw 127 lands exactly on max
        let scaled = (raw * span + 63) / 127;
        self.value = self.min + scaled as u16;
        self.last_event = Some(at);
        self.value
    }

    /// Apply a signed delta with clamping.
    ///
    /// Returns `(new_value, hit_limit)`. Clamping is idempotent: repeated
    /// deltas at a bound leave the value unchanged, which callers use to
    /// suppress redundant monitor writes.
    pub fn apply_relative(&mut self, delta: i32, at: Instant) -> (u16, bool) {
        let target = self.value as i64 + delta as i64;
        let clamped = target.clamp(self.min as i64, self.max as i64) as u16;
        let hit_limit = target != clamped as i64 && delta != 0;
        self.value = clamped;
        self.last_event = Some(at);
        (self.value, hit_limit)
    }

    /// Position on a 12-segment LED ring (0-11) for surface feedback
    pub fn led_position(&self) -> u8 {
        let span = (self.max - self.min) as u32;
        ((self.value - self.min) as u32 * 11 / span) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn knob() -> VirtualKnob {
        VirtualKnob::new("brightness", 75, 0, 100)
    }

    #[test]
    fn test_relative_clamps_at_bounds() {
        let mut k = knob();
        let now = Instant::now();

        let (v, hit) = k.apply_relative(100, now);
        assert_eq!(v, 100);
        assert!(hit);

        // Further increments at the ceiling change nothing
        let (v, hit) = k.apply_relative(1, now);
        assert_eq!(v, 100);
        assert!(hit);

        let (v, hit) = k.apply_relative(-300, now);
        assert_eq!(v, 0);
        assert!(hit);
    }

    #[test]
    fn test_relative_within_domain_no_limit() {
        let mut k = knob();
        let (v, hit) = k.apply_relative(-5, Instant::now());
        assert_eq!(v, 70);
        assert!(!hit);
    }

    #[test]
    fn test_absolute_rescales_exactly() {
        let mut k = knob();
        let now = Instant::now();

        assert_eq!(k.apply_absolute(0, now), 0);
        assert_eq!(k.apply_absolute(127, now), 100);
        assert_eq!(k.apply_absolute(64, now), 50);
    }

    #[test]
    fn test_absolute_ignores_prior_deltas() {
        let mut k = knob();
        let now = Instant::now();

        k.apply_relative(-40, now);
        assert_eq!(k.apply_absolute(127, now), 100);
    }

    #[test]
    fn test_seed_clamps() {
        let mut k = VirtualKnob::new("gain", 50, 10, 90);
        assert_eq!(k.seed(200), 90);
        assert_eq!(k.seed(0), 10);
    }

    #[test]
    fn test_led_position() {
        let mut k = knob();
        k.seed(0);
        assert_eq!(k.led_position(), 0);
        k.seed(100);
        assert_eq!(k.led_position(), 11);
        k.seed(50);
        assert_eq!(k.led_position(), 5);
    }

    proptest! {
        /// Clamp invariant: any delta sequence keeps the value in the domain
        #[test]
        fn prop_relative_stays_in_domain(deltas in prop::collection::vec(-200i32..200, 0..64)) {
            let mut k = knob();
            let now = Instant::now();
            for d in deltas {
                let (v, _) = k.apply_relative(d, now);
                prop_assert!(v <= 100);
                prop_assert_eq!(v, k.current());
            }
        }

        /// Absolute input alone determines the result
        #[test]
        fn prop_absolute_matches_rescale(raw in 0u8..=127, premix in -500i32..500) {
            let mut k = knob();
            let now = Instant::now();
            k.apply_relative(premix, now);
            let v = k.apply_absolute(raw, now);
            let expected = ((raw as u32 * 100 + 63) / 127) as u16;
            prop_assert_eq!(v, expected);
        }
    }
}
