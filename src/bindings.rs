//! Control binding table
//!
//! Compiles the free-form YAML control list into a closed, typed set of
//! bindings at load time. Malformed entries are rejected here, never lazily
//! per-event. The compiled table is immutable and owned by the mapper.

use std::collections::HashMap;

use thiserror::Error;

use crate::config::{AppConfig, ControlConfig, ControlRef, KindSpec, TransformSpec};
use crate::midi::{ControlId, RelativeMode};

/// Fatal configuration error: the binding table is never partially applied
#[derive(Debug, Error)]
pub enum BindingError {
    #[error("binding '{action}': invalid value domain [{min}, {max}]")]
    InvalidDomain { action: String, min: u16, max: u16 },

    #[error("binding '{action}': physical control {control} already bound to '{other}'")]
    DuplicateControl {
        action: String,
        control: ControlId,
        other: String,
    },

    #[error("duplicate action name '{action}'")]
    DuplicateAction { action: String },

    #[error("exclusivity group '{group}' references unknown action '{action}'")]
    UnknownGroupMember { group: String, action: String },

    #[error("exclusivity group '{group}' member '{action}' is not a button")]
    NonButtonGroupMember { group: String, action: String },

    #[error("binding '{action}': {detail}")]
    Invalid { action: String, detail: String },
}

/// Inclusive value domain of a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueDomain {
    pub min: u16,
    pub max: u16,
}

impl ValueDomain {
    pub fn midpoint(&self) -> u16 {
        self.min + (self.max - self.min) / 2
    }
}

/// How events on this control are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Absolute,
    Relative { mode: RelativeMode },
    Button,
}

/// Commands a binding emits, resolved from transform + target codes
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommandPlan {
    /// Virtual value written as-is
    Direct { code: u8 },
    /// Virtual value through `v * scale + offset`, clamped to the domain
    Linear { code: u8, scale: f64, offset: f64 },
    /// Knob position to RGB gains, one command per channel.
    /// Emission order is red, green, blue: the display applies partial
    /// updates visibly, so the order is part of the contract.
    NightCurve { red: u8, green: u8, blue: u8 },
    /// Boolean toggle
    Toggle { code: u8, on_value: u16, off_value: u16 },
}

impl CommandPlan {
    /// VCP codes this plan touches, in emission order
    pub fn codes(&self) -> Vec<u8> {
        match *self {
            CommandPlan::Direct { code }
            | CommandPlan::Linear { code, .. }
            | CommandPlan::Toggle { code, .. } => vec![code],
            CommandPlan::NightCurve { red, green, blue } => vec![red, green, blue],
        }
    }
}

/// Surface LED driven by this binding's state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedTarget {
    /// Encoder LED ring index (0-7)
    Ring(u8),
    /// Button LED note
    Note(u8),
}

/// One compiled control binding. Immutable after load.
#[derive(Debug, Clone)]
pub struct ControlBinding {
    pub action: String,
    pub control: ControlId,
    pub kind: ControlKind,
    pub domain: ValueDomain,
    pub plan: CommandPlan,
    pub group: Option<String>,
    pub initial: Option<u16>,
    pub led: Option<LedTarget>,
}

impl ControlBinding {
    /// Commands for a knob binding at `value`, in emission order
    pub fn knob_commands(&self, value: u16) -> Vec<(u8, u16)> {
        match self.plan {
            CommandPlan::Direct { code } => vec![(code, value)],
            CommandPlan::Linear { code, scale, offset } => {
                let v = (value as f64 * scale + offset)
                    .round()
                    .clamp(self.domain.min as f64, self.domain.max as f64);
                vec![(code, v as u16)]
            }
            CommandPlan::NightCurve { red, green, blue } => {
                let [r, g, b] = night_curve(value, self.domain);
                vec![(red, r), (green, g), (blue, b)]
            }
            CommandPlan::Toggle { .. } => Vec::new(),
        }
    }

    /// Command for a button binding in state `on`
    pub fn toggle_command(&self, on: bool) -> Option<(u8, u16)> {
        match self.plan {
            CommandPlan::Toggle { code, on_value, off_value } => {
                Some((code, if on { on_value } else { off_value }))
            }
            _ => None,
        }
    }

    pub fn is_button(&self) -> bool {
        self.kind == ControlKind::Button
    }
}

/// Warm color shift for the night-mode knob.
///
/// At the calibrated stop (domain max) all channels sit at full gain; moving
/// toward the floor leaves red alone and rolls green off to 65% and blue to
/// 30% of the span, approximating a 6500K -> 2700K sweep.
fn night_curve(value: u16, domain: ValueDomain) -> [u16; 3] {
    let span = (domain.max - domain.min) as f64;
    let pos = (value.clamp(domain.min, domain.max) - domain.min) as f64 / span;
    let warm = 1.0 - pos;
    let red = domain.max as f64;
    let green = domain.max as f64 - warm * span * 0.35;
    let blue = domain.max as f64 - warm * span * 0.70;
    [red.round() as u16, green.round() as u16, blue.round() as u16]
}

/// Knob position recovered from a blue-gain read-back. Blue has the steepest
/// roll-off of the three channels, so it identifies the position uniquely.
pub(crate) fn night_position_from_blue(blue: u16, domain: ValueDomain) -> u16 {
    let span = (domain.max - domain.min) as f64;
    let blue = blue.clamp(domain.min, domain.max) as f64;
    let warm = (domain.max as f64 - blue) / (span * 0.70);
    let value = domain.max as f64 - warm * span;
    value.round().clamp(domain.min as f64, domain.max as f64) as u16
}

/// Compiled, validated binding table
#[derive(Debug, Clone)]
pub struct BindingTable {
    bindings: Vec<ControlBinding>,
    by_control: HashMap<ControlId, usize>,
    by_action: HashMap<String, usize>,
    /// Exclusivity groups: group id -> member actions, declaration order
    groups: HashMap<String, Vec<String>>,
}

impl BindingTable {
    /// Compile and validate the configured control list
    pub fn compile(config: &AppConfig) -> Result<Self, BindingError> {
        let mut bindings = Vec::with_capacity(config.controls.len());
        let mut by_control = HashMap::new();
        let mut by_action = HashMap::new();
        let mut groups: HashMap<String, Vec<String>> = HashMap::new();

        for entry in &config.controls {
            let binding = compile_binding(entry)?;

            if let Some(&idx) = by_control.get(&binding.control) {
                let other: &ControlBinding = &bindings[idx];
                return Err(BindingError::DuplicateControl {
                    action: binding.action,
                    control: binding.control,
                    other: other.action.clone(),
                });
            }
            if by_action.contains_key(&binding.action) {
                return Err(BindingError::DuplicateAction { action: binding.action });
            }

            if let Some(group) = &binding.group {
                let members = groups.entry(group.clone()).or_default();
                if !members.contains(&binding.action) {
                    members.push(binding.action.clone());
                }
            }

            by_control.insert(binding.control, bindings.len());
            by_action.insert(binding.action.clone(), bindings.len());
            bindings.push(binding);
        }

        // Explicitly declared groups must reference existing button bindings
        for (group, members) in &config.exclusive_groups {
            for action in members {
                let idx = *by_action.get(action).ok_or_else(|| {
                    BindingError::UnknownGroupMember {
                        group: group.clone(),
                        action: action.clone(),
                    }
                })?;
                if !bindings[idx].is_button() {
                    return Err(BindingError::NonButtonGroupMember {
                        group: group.clone(),
                        action: action.clone(),
                    });
                }
                let known = groups.entry(group.clone()).or_default();
                if !known.contains(action) {
                    known.push(action.clone());
                }
            }
        }

        Ok(Self {
            bindings,
            by_control,
            by_action,
            groups,
        })
    }

    /// Look up the binding for a physical control, if any
    pub fn lookup(&self, control: ControlId) -> Option<&ControlBinding> {
        self.by_control.get(&control).map(|&idx| &self.bindings[idx])
    }

    /// Look up a binding by logical action name
    pub fn get(&self, action: &str) -> Option<&ControlBinding> {
        self.by_action.get(action).map(|&idx| &self.bindings[idx])
    }

    /// Members of an exclusivity group, declaration order
    pub fn group_members(&self, group: &str) -> &[String] {
        self.groups.get(group).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ControlBinding> {
        self.bindings.iter()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// All VCP codes the table can touch, deduplicated, stable order.
    /// This is the capability-probe worklist.
    pub fn probe_codes(&self) -> Vec<u8> {
        let mut codes = Vec::new();
        for binding in &self.bindings {
            for code in binding.plan.codes() {
                if !codes.contains(&code) {
                    codes.push(code);
                }
            }
        }
        codes
    }
}

fn compile_binding(entry: &ControlConfig) -> Result<ControlBinding, BindingError> {
    let action = entry.action.clone();
    let invalid = |detail: &str| BindingError::Invalid {
        action: action.clone(),
        detail: detail.to_string(),
    };

    let [min, max] = entry.domain;
    if min >= max {
        return Err(BindingError::InvalidDomain {
            action: entry.action.clone(),
            min,
            max,
        });
    }
    let domain = ValueDomain { min, max };

    if let Some(initial) = entry.initial {
        if initial < min || initial > max {
            return Err(invalid(&format!("initial {} outside domain", initial)));
        }
    }

    let (control, kind) = match (entry.control, entry.kind) {
        (ControlRef::Cc(cc), KindSpec::Absolute) => (ControlId::Cc(cc), ControlKind::Absolute),
        (ControlRef::Cc(cc), KindSpec::Relative) => (
            ControlId::Cc(cc),
            ControlKind::Relative { mode: entry.relative_mode },
        ),
        (ControlRef::Note(note), KindSpec::Button) => (ControlId::Note(note), ControlKind::Button),
        (ControlRef::Note(_), _) => {
            return Err(invalid("knob kinds require a cc control"));
        }
        (ControlRef::Cc(_), KindSpec::Button) => {
            return Err(invalid("button bindings require a note control"));
        }
    };

    let plan = if kind == ControlKind::Button {
        if !matches!(entry.transform, TransformSpec::Identity) {
            return Err(invalid("buttons do not take a transform"));
        }
        let code = entry.code.ok_or_else(|| invalid("button requires a code"))?;
        CommandPlan::Toggle {
            code,
            on_value: entry.on_value,
            off_value: entry.off_value,
        }
    } else {
        match entry.transform {
            TransformSpec::Identity => {
                let code = entry.code.ok_or_else(|| invalid("transform requires a code"))?;
                CommandPlan::Direct { code }
            }
            TransformSpec::Linear { scale, offset } => {
                let code = entry.code.ok_or_else(|| invalid("transform requires a code"))?;
                CommandPlan::Linear { code, scale, offset }
            }
            TransformSpec::NightCurve => {
                let rgb = entry
                    .rgb_codes
                    .ok_or_else(|| invalid("night_curve requires rgb_codes"))?;
                CommandPlan::NightCurve {
                    red: rgb.red,
                    green: rgb.green,
                    blue: rgb.blue,
                }
            }
        }
    };

    if entry.group.is_some() && kind != ControlKind::Button {
        return Err(invalid("exclusivity groups only apply to buttons"));
    }

    if let (CommandPlan::Toggle { on_value, off_value, .. }, Some(initial)) = (plan, entry.initial)
    {
        if initial != on_value && initial != off_value {
            return Err(invalid("button initial must be on_value or off_value"));
        }
    }

    let led = match (entry.led_ring, entry.led_note) {
        (Some(_), Some(_)) => return Err(invalid("led_ring and led_note are mutually exclusive")),
        (Some(ring), None) => {
            if ring > 7 {
                return Err(invalid("led_ring must be 0-7"));
            }
            Some(LedTarget::Ring(ring))
        }
        (None, Some(note)) => Some(LedTarget::Note(note)),
        (None, None) => None,
    };

    Ok(ControlBinding {
        action: entry.action.clone(),
        control,
        kind,
        domain,
        plan,
        group: entry.group.clone(),
        initial: entry.initial,
        led,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn parse(yaml: &str) -> AppConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn base_yaml(controls: &str) -> String {
        format!(
            "midi: {{ input_port: a, output_port: b }}\ncontrols:\n{}",
            controls
        )
    }

    #[test]
    fn test_compile_knob_and_button() {
        let config = parse(&base_yaml(
            r#"
  - action: brightness
    control: { cc: 1 }
    kind: relative
    code: 0x10
  - action: local_dimming
    control: { note: 8 }
    kind: button
    code: 0xF4
    group: picture
"#,
        ));
        let table = BindingTable::compile(&config).unwrap();
        assert_eq!(table.len(), 2);

        let knob = table.lookup(ControlId::Cc(1)).unwrap();
        assert_eq!(knob.action, "brightness");
        assert_eq!(knob.knob_commands(80), vec![(0x10, 80)]);

        let button = table.lookup(ControlId::Note(8)).unwrap();
        assert_eq!(button.toggle_command(true), Some((0xF4, 1)));
        assert_eq!(button.toggle_command(false), Some((0xF4, 0)));
        assert_eq!(table.group_members("picture"), ["local_dimming"]);
    }

    #[test]
    fn test_unknown_control_lookup_is_none() {
        let config = parse(&base_yaml(
            "  - { action: brightness, control: { cc: 1 }, kind: relative, code: 0x10 }\n",
        ));
        let table = BindingTable::compile(&config).unwrap();
        assert!(table.lookup(ControlId::Cc(99)).is_none());
    }

    #[test]
    fn test_invalid_domain_rejected() {
        let config = parse(&base_yaml(
            "  - { action: brightness, control: { cc: 1 }, kind: relative, code: 0x10, domain: [50, 50] }\n",
        ));
        assert!(matches!(
            BindingTable::compile(&config),
            Err(BindingError::InvalidDomain { .. })
        ));
    }

    #[test]
    fn test_unknown_group_member_rejected() {
        let yaml = r#"
midi: { input_port: a, output_port: b }
controls:
  - { action: local_dimming, control: { note: 8 }, kind: button, code: 0xF4 }
exclusive_groups:
  picture: [local_dimming, hdr]
"#;
        assert!(matches!(
            BindingTable::compile(&parse(yaml)),
            Err(BindingError::UnknownGroupMember { .. })
        ));
    }

    #[test]
    fn test_group_on_knob_rejected() {
        let config = parse(&base_yaml(
            "  - { action: brightness, control: { cc: 1 }, kind: relative, code: 0x10, group: picture }\n",
        ));
        assert!(matches!(
            BindingTable::compile(&config),
            Err(BindingError::Invalid { .. })
        ));
    }

    #[test]
    fn test_duplicate_control_rejected() {
        let config = parse(&base_yaml(
            "  - { action: a1, control: { cc: 1 }, kind: relative, code: 0x10 }\n  - { action: a2, control: { cc: 1 }, kind: absolute, code: 0x12 }\n",
        ));
        assert!(matches!(
            BindingTable::compile(&config),
            Err(BindingError::DuplicateControl { .. })
        ));
    }

    #[test]
    fn test_night_curve_requires_rgb_codes() {
        let config = parse(&base_yaml(
            "  - { action: night, control: { cc: 2 }, kind: relative, transform: night_curve }\n",
        ));
        assert!(matches!(
            BindingTable::compile(&config),
            Err(BindingError::Invalid { .. })
        ));
    }

    #[test]
    fn test_night_curve_emission_order_and_values() {
        let config = parse(&base_yaml(
            "  - action: night\n    control: { cc: 2 }\n    kind: relative\n    transform: night_curve\n    rgb_codes: { red: 0x16, green: 0x18, blue: 0x1A }\n",
        ));
        let table = BindingTable::compile(&config).unwrap();
        let night = table.get("night").unwrap();

        // Calibrated stop: full gain everywhere
        assert_eq!(
            night.knob_commands(100),
            vec![(0x16, 100), (0x18, 100), (0x1A, 100)]
        );

        // Midpoint: red untouched, green and blue rolled off, r-g-b order
        let cmds = night.knob_commands(50);
        assert_eq!(cmds.len(), 3);
        assert_eq!(cmds[0], (0x16, 100));
        assert_eq!(cmds[1], (0x18, 83));
        assert_eq!(cmds[2], (0x1A, 65));

        // Floor: warmest point
        assert_eq!(
            night.knob_commands(0),
            vec![(0x16, 100), (0x18, 65), (0x1A, 30)]
        );
    }

    #[test]
    fn test_night_position_from_blue_inverts_curve() {
        let domain = ValueDomain { min: 0, max: 100 };
        assert_eq!(night_position_from_blue(100, domain), 100);
        assert_eq!(night_position_from_blue(65, domain), 50);
        assert_eq!(night_position_from_blue(30, domain), 0);
        // Out-of-range read-backs clamp instead of wrapping
        assert_eq!(night_position_from_blue(200, domain), 100);
    }

    #[test]
    fn test_button_initial_must_match_toggle_values() {
        let config = parse(&base_yaml(
            "  - { action: dim, control: { note: 8 }, kind: button, code: 0xF4, initial: 7 }\n",
        ));
        assert!(matches!(
            BindingTable::compile(&config),
            Err(BindingError::Invalid { .. })
        ));
    }

    #[test]
    fn test_linear_plan_clamps_to_domain() {
        let config = parse(&base_yaml(
            "  - action: contrast\n    control: { cc: 3 }\n    kind: absolute\n    code: 0x12\n    transform: { linear: { scale: 2.0, offset: 0 } }\n",
        ));
        let table = BindingTable::compile(&config).unwrap();
        let contrast = table.get("contrast").unwrap();
        assert_eq!(contrast.knob_commands(30), vec![(0x12, 60)]);
        assert_eq!(contrast.knob_commands(80), vec![(0x12, 100)]);
    }

    #[test]
    fn test_probe_codes_deduplicated() {
        let config = parse(&base_yaml(
            r#"
  - action: night
    control: { cc: 2 }
    kind: relative
    transform: night_curve
    rgb_codes: { red: 0x16, green: 0x18, blue: 0x1A }
  - { action: blue_direct, control: { cc: 3 }, kind: absolute, code: 0x1A }
"#,
        ));
        let table = BindingTable::compile(&config).unwrap();
        assert_eq!(table.probe_codes(), vec![0x16, 0x18, 0x1A]);
    }
}
