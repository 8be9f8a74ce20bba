//! ddc-gw - MIDI control surface gateway for DDC/CI monitor control
//!
//! Maps knobs and buttons on a MIDI surface to monitor VCP features:
//! brightness and contrast on encoders, a night-mode knob that warms the
//! RGB gains, and picture-mode toggles with mutual exclusivity. Virtual
//! state lives on this side of the slow DDC bus so the surface stays
//! responsive while writes are coalesced, deduplicated, and retried.

pub mod bindings;
pub mod config;
pub mod engine;
pub mod knob;
pub mod mapper;
pub mod midi;
pub mod monitor;
pub mod surface;
pub mod toggle;
