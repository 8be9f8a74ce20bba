//! MIDI utilities and message types
//!
//! Provides parsing and encoding for the small subset of MIDI the control
//! surface speaks (Control Change for knobs and LED rings, Note On/Off for
//! buttons and their LEDs), plus relative-encoder delta decoding.

use std::fmt;
use std::time::Instant;

use serde::Deserialize;

/// MIDI message types used by the surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidiMessage {
    /// Note Off: channel (0-15), note (0-127), velocity (0-127)
    NoteOff { channel: u8, note: u8, velocity: u8 },

    /// Note On: channel (0-15), note (0-127), velocity (0-127)
    NoteOn { channel: u8, note: u8, velocity: u8 },

    /// Control Change: channel (0-15), cc (0-127), value (0-127)
    ControlChange { channel: u8, cc: u8, value: u8 },
}

impl MidiMessage {
    /// Parse a MIDI message from raw bytes.
    ///
    /// Messages the gateway does not care about (pitch bend, sysex, clock...)
    /// return `None` and are dropped at the input callback.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 3 {
            return None;
        }

        let status = data[0];
        if status < 0x80 {
            // Running status is not produced by the surfaces we target
            return None;
        }

        let message_type = status & 0xF0;
        let channel = status & 0x0F;

        match message_type {
            0x80 => Some(MidiMessage::NoteOff {
                channel,
                note: data[1] & 0x7F,
                velocity: data[2] & 0x7F,
            }),
            0x90 => {
                // Note On with velocity 0 is a Note Off
                let note = data[1] & 0x7F;
                let velocity = data[2] & 0x7F;
                if velocity == 0 {
                    Some(MidiMessage::NoteOff { channel, note, velocity: 0 })
                } else {
                    Some(MidiMessage::NoteOn { channel, note, velocity })
                }
            }
            0xB0 => Some(MidiMessage::ControlChange {
                channel,
                cc: data[1] & 0x7F,
                value: data[2] & 0x7F,
            }),
            _ => None,
        }
    }

    /// Encode the message to MIDI bytes
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            MidiMessage::NoteOff { channel, note, velocity } => {
                vec![0x80 | (channel & 0x0F), note & 0x7F, velocity & 0x7F]
            }
            MidiMessage::NoteOn { channel, note, velocity } => {
                vec![0x90 | (channel & 0x0F), note & 0x7F, velocity & 0x7F]
            }
            MidiMessage::ControlChange { channel, cc, value } => {
                vec![0xB0 | (channel & 0x0F), cc & 0x7F, value & 0x7F]
            }
        }
    }
}

impl fmt::Display for MidiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MidiMessage::NoteOff { channel, note, velocity } => {
                write!(f, "NoteOff ch:{} n:{} v:{}", channel + 1, note, velocity)
            }
            MidiMessage::NoteOn { channel, note, velocity } => {
                write!(f, "NoteOn ch:{} n:{} v:{}", channel + 1, note, velocity)
            }
            MidiMessage::ControlChange { channel, cc, value } => {
                write!(f, "CC ch:{} cc:{} v:{}", channel + 1, cc, value)
            }
        }
    }
}

/// Physical control address on the surface.
///
/// Knobs and encoders arrive as Control Change, buttons as Note On.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlId {
    Cc(u8),
    Note(u8),
}

impl fmt::Display for ControlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ControlId::Cc(cc) => write!(f, "cc{}", cc),
            ControlId::Note(note) => write!(f, "note{}", note),
        }
    }
}

/// Normalized controller event handed to the mapper.
///
/// `value` is the raw 7-bit data byte: an absolute position for absolute
/// knobs, an encoded delta for relative encoders, a velocity for buttons.
/// Interpretation is decided by the matching binding, not here.
#[derive(Debug, Clone, Copy)]
pub struct ControlEvent {
    pub control: ControlId,
    pub value: u8,
    pub at: Instant,
}

impl ControlEvent {
    /// Build an event from a parsed message. Button releases and messages the
    /// surface uses for other purposes yield `None`.
    pub fn from_message(message: &MidiMessage, at: Instant) -> Option<Self> {
        match *message {
            MidiMessage::ControlChange { cc, value, .. } => Some(Self {
                control: ControlId::Cc(cc),
                value,
                at,
            }),
            MidiMessage::NoteOn { note, velocity, .. } => Some(Self {
                control: ControlId::Note(note),
                value: velocity,
                at,
            }),
            // Momentary buttons act on press; releases carry no information
            MidiMessage::NoteOff { .. } => None,
        }
    }
}

/// Sign conventions used by encoder firmware to report per-tick deltas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RelativeMode {
    /// 1..=63 increment, 127 down to 65 decrement (value - 128)
    #[default]
    TwosComplement,
    /// Offset around 64: 65 is +1, 63 is -1
    BinaryOffset,
    /// Bit 6 is the sign, low bits the magnitude
    SignMagnitude,
}

/// Decode a relative-encoder CC value into a signed per-tick delta
pub fn relative_delta(value: u8, mode: RelativeMode) -> i32 {
    let value = value & 0x7F;
    match mode {
        RelativeMode::TwosComplement => {
            if value < 64 {
                value as i32
            } else {
                value as i32 - 128
            }
        }
        RelativeMode::BinaryOffset => value as i32 - 64,
        RelativeMode::SignMagnitude => {
            let magnitude = (value & 0x3F) as i32;
            if value & 0x40 != 0 {
                -magnitude
            } else {
                magnitude
            }
        }
    }
}

/// Format MIDI bytes as hex string for debugging
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
