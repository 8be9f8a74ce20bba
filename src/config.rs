//! Configuration management for DDC GW
//!
//! Handles loading and parsing of the YAML configuration file: MIDI port
//! patterns, monitor selection, engine tuning, and the control binding table.
//! Structural validation of bindings happens in [`crate::bindings`].

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;

use crate::midi::RelativeMode;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub midi: MidiConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    pub controls: Vec<ControlConfig>,
    /// Optional explicit group membership lists, validated against `controls`
    #[serde(default)]
    pub exclusive_groups: HashMap<String, Vec<String>>,
}

/// MIDI port configuration (case-insensitive substring patterns)
#[derive(Debug, Clone, Deserialize)]
pub struct MidiConfig {
    pub input_port: String,
    pub output_port: String,
}

/// Monitor selection
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MonitorConfig {
    /// Substring matched against the display's model/id; first display wins
    /// when absent
    #[serde(rename = "match")]
    pub model_match: Option<String>,
}

/// Engine tuning knobs
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Minimum interval between accepted button transitions
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Virtual-value change per encoder tick
    #[serde(default = "default_encoder_step")]
    pub encoder_step: u16,

    /// Transport attempts per command (first try included)
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Base delay of the exponential backoff between attempts
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Reset night-mode knobs to their calibrated stop (domain max) at startup
    #[serde(default = "default_true")]
    pub always_start_calibrated: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            encoder_step: default_encoder_step(),
            retry_attempts: default_retry_attempts(),
            retry_base_ms: default_retry_base_ms(),
            always_start_calibrated: true,
        }
    }
}

/// Physical control address in config form
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlRef {
    /// Knob or encoder sending Control Change
    Cc(u8),
    /// Button sending Note On
    Note(u8),
}

/// Control kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KindSpec {
    Absolute,
    Relative,
    Button,
}

/// Value transform in config form
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformSpec {
    #[default]
    Identity,
    Linear {
        scale: f64,
        offset: f64,
    },
    /// Knob position to per-channel RGB gains (requires `rgb_codes`)
    NightCurve,
}

/// Per-channel VCP gain codes for curve transforms
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RgbCodes {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

/// One control binding as written in YAML
#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Logical action name, e.g. "brightness", "local_dimming"
    pub action: String,
    pub control: ControlRef,
    pub kind: KindSpec,
    #[serde(default)]
    pub relative_mode: RelativeMode,

    /// Target VCP code for single-command bindings
    pub code: Option<u8>,
    /// Target VCP codes for the night curve
    pub rgb_codes: Option<RgbCodes>,

    #[serde(default = "default_domain")]
    pub domain: [u16; 2],
    #[serde(default)]
    pub transform: TransformSpec,

    /// Exclusivity group id (buttons only)
    pub group: Option<String>,

    /// Startup value when the monitor cannot be read. For buttons this is
    /// the VCP value to assume and write through (must be on_value or
    /// off_value).
    pub initial: Option<u16>,

    /// VCP values written for button on/off
    #[serde(default = "default_on_value")]
    pub on_value: u16,
    #[serde(default)]
    pub off_value: u16,

    /// Encoder LED ring index (0-7) for knob feedback
    pub led_ring: Option<u8>,
    /// Button LED note for toggle feedback
    pub led_note: Option<u8>,
}

impl AppConfig {
    /// Load and parse a YAML configuration file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AppConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}

fn default_debounce_ms() -> u64 {
    50
}

fn default_encoder_step() -> u16 {
    2
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_domain() -> [u16; 2] {
    [0, 100]
}

fn default_on_value() -> u16 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
midi:
  input_port: "X-TOUCH MINI"
  output_port: "X-TOUCH MINI"
monitor:
  match: "EX321UX"
engine:
  debounce_ms: 40
  encoder_step: 2
controls:
  - action: brightness
    control: { cc: 1 }
    kind: relative
    code: 0x10
    initial: 75
    led_ring: 0
  - action: night_mode
    control: { cc: 2 }
    kind: relative
    transform: night_curve
    rgb_codes: { red: 0x16, green: 0x18, blue: 0x1A }
    led_ring: 1
  - action: local_dimming
    control: { note: 8 }
    kind: button
    code: 0xF4
    group: picture
    led_note: 8
  - action: enhancement
    control: { note: 9 }
    kind: button
    code: 0xF5
    group: picture
    led_note: 9
exclusive_groups:
  picture: [local_dimming, enhancement]
"#;

    #[test]
    fn test_parse_sample() {
        let config: AppConfig = serde_yaml::from_str(SAMPLE).unwrap();

        assert_eq!(config.midi.input_port, "X-TOUCH MINI");
        assert_eq!(config.monitor.model_match.as_deref(), Some("EX321UX"));
        assert_eq!(config.engine.debounce_ms, 40);
        // Defaults fill unspecified engine fields
        assert_eq!(config.engine.retry_attempts, 3);
        assert!(config.engine.always_start_calibrated);

        assert_eq!(config.controls.len(), 4);
        let brightness = &config.controls[0];
        assert_eq!(brightness.code, Some(0x10));
        assert_eq!(brightness.domain, [0, 100]);
        assert!(matches!(brightness.control, ControlRef::Cc(1)));

        let night = &config.controls[1];
        assert!(matches!(night.transform, TransformSpec::NightCurve));
        assert_eq!(night.rgb_codes.unwrap().blue, 0x1A);

        assert_eq!(config.exclusive_groups["picture"].len(), 2);
    }

    #[test]
    fn test_linear_transform_parses() {
        let yaml = r#"
midi: { input_port: "a", output_port: "b" }
controls:
  - action: contrast
    control: { cc: 3 }
    kind: absolute
    code: 0x12
    transform: { linear: { scale: 0.5, offset: 25 } }
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        match config.controls[0].transform {
            TransformSpec::Linear { scale, offset } => {
                assert_eq!(scale, 0.5);
                assert_eq!(offset, 25.0);
            }
            other => panic!("unexpected transform: {:?}", other),
        }
    }
}
