//! Control mapper
//!
//! Routes normalized controller events to virtual knob and toggle state and
//! drives the monitor command interface through each binding's command plan.
//! Exclusively owns all virtual state for the process lifetime; the dispatch
//! worker is the only caller, which serializes every monitor command.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bindings::{
    night_position_from_blue, BindingTable, CommandPlan, ControlBinding, ControlKind, LedTarget,
};
use crate::config::EngineConfig;
use crate::knob::VirtualKnob;
use crate::midi::{relative_delta, ControlEvent, RelativeMode};
use crate::monitor::{CommandOutcome, CommandResult, MonitorCommands};
use crate::toggle::Toggle;

/// LED feedback emitted toward the surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    /// Encoder LED ring position (0-11)
    Ring { index: u8, position: u8 },
    /// Button LED on/off
    Button { note: u8, on: bool },
}

/// Maps controller events to monitor commands with virtual state
pub struct ControlMapper {
    table: BindingTable,
    monitor: MonitorCommands,
    /// Virtual knob per continuous binding, keyed by action
    knobs: HashMap<String, VirtualKnob>,
    /// Toggle per button binding, keyed by action
    toggles: HashMap<String, Toggle>,
    encoder_step: u16,
    always_start_calibrated: bool,
    feedback: mpsc::UnboundedSender<Feedback>,
}

impl ControlMapper {
    pub fn new(
        table: BindingTable,
        monitor: MonitorCommands,
        engine: &EngineConfig,
        feedback: mpsc::UnboundedSender<Feedback>,
    ) -> Self {
        let debounce = Duration::from_millis(engine.debounce_ms);
        let mut knobs = HashMap::new();
        let mut toggles = HashMap::new();

        for binding in table.iter() {
            match binding.kind {
                ControlKind::Button => {
                    toggles.insert(binding.action.clone(), Toggle::new(false, debounce));
                }
                _ => {
                    // Night-mode knobs rest at the calibrated stop; everything
                    // else starts at its configured initial or the midpoint
                    let initial = binding.initial.unwrap_or(match binding.plan {
                        CommandPlan::NightCurve { .. } => binding.domain.max,
                        _ => binding.domain.midpoint(),
                    });
                    knobs.insert(
                        binding.action.clone(),
                        VirtualKnob::new(
                            binding.action.clone(),
                            initial,
                            binding.domain.min,
                            binding.domain.max,
                        ),
                    );
                }
            }
        }

        Self {
            table,
            monitor,
            knobs,
            toggles,
            encoder_step: engine.encoder_step,
            always_start_calibrated: engine.always_start_calibrated,
            feedback,
        }
    }

    /// Run the startup capability probe over every configured VCP code
    pub async fn probe(&mut self) -> usize {
        let codes = self.table.probe_codes();
        self.monitor.probe(&codes).await
    }

    /// Sync virtual state with the actual monitor and light the LEDs.
    ///
    /// Knobs seed from a monitor read where the code supports it, otherwise
    /// keep their defaults. Night-mode knobs reset to the calibrated stop and
    /// write through when `always_start_calibrated` is set.
    pub async fn initialize(&mut self) {
        let bindings: Vec<ControlBinding> = self.table.iter().cloned().collect();

        for binding in &bindings {
            match binding.plan {
                CommandPlan::Toggle { code, on_value, .. } => {
                    match self.monitor.get(code).await {
                        Ok(Some(value)) => {
                            let on = value == on_value;
                            if let Some(toggle) = self.toggles.get_mut(&binding.action) {
                                toggle.seed(on);
                            }
                            debug!("{}: seeded {}", binding.action, if on { "ON" } else { "OFF" });
                        }
                        _ => {
                            // Unreadable code: fall back to the configured
                            // default and write it through so the monitor and
                            // the virtual state agree
                            if let Some(initial) = binding.initial {
                                let on = initial == on_value;
                                if let Some(toggle) = self.toggles.get_mut(&binding.action) {
                                    toggle.seed(on);
                                }
                                self.monitor.set(code, initial).await;
                                debug!(
                                    "{}: defaulted {}",
                                    binding.action,
                                    if on { "ON" } else { "OFF" }
                                );
                            }
                        }
                    }
                    let on = self
                        .toggles
                        .get(&binding.action)
                        .map(Toggle::current)
                        .unwrap_or(false);
                    self.send_button_led(binding, on);
                }
                CommandPlan::NightCurve { blue, .. } => {
                    if self.always_start_calibrated {
                        let max = binding.domain.max;
                        if let Some(knob) = self.knobs.get_mut(&binding.action) {
                            knob.seed(max);
                        }
                        self.issue_knob_commands(binding, max).await;
                        debug!("{}: reset to calibrated", binding.action);
                    } else if let Ok(Some(gain)) = self.monitor.get(blue).await {
                        // Recover the knob position from the blue gain so the
                        // first tick moves from where the monitor actually is
                        let value = night_position_from_blue(gain, binding.domain);
                        if let Some(knob) = self.knobs.get_mut(&binding.action) {
                            knob.seed(value);
                        }
                        debug!("{}: seeded {} from blue gain {}", binding.action, value, gain);
                    }
                    self.send_knob_led(binding);
                }
                CommandPlan::Direct { code } | CommandPlan::Linear { code, .. } => {
                    if let Ok(Some(value)) = self.monitor.get(code).await {
                        let virtual_value = self.invert_plan(binding, value);
                        if let Some(knob) = self.knobs.get_mut(&binding.action) {
                            knob.seed(virtual_value);
                            debug!("{}: seeded {}", binding.action, virtual_value);
                        }
                    }
                    self.send_knob_led(binding);
                }
            }
        }

        info!(
            "Control mapper initialized: {} bindings on {}",
            bindings.len(),
            self.monitor.describe()
        );
    }

    /// Route one controller event. Events for unbound controls are discarded;
    /// command failures are logged outcomes, never errors.
    pub async fn route(&mut self, event: ControlEvent) -> Vec<CommandResult> {
        let Some(binding) = self.table.lookup(event.control).cloned() else {
            debug!("Ignoring unmapped control {}", event.control);
            return Vec::new();
        };

        match binding.kind {
            ControlKind::Absolute => self.route_absolute(&binding, event).await,
            ControlKind::Relative { mode } => self.route_relative(&binding, mode, event).await,
            ControlKind::Button => self.route_button(&binding, event).await,
        }
    }

    async fn route_absolute(
        &mut self,
        binding: &ControlBinding,
        event: ControlEvent,
    ) -> Vec<CommandResult> {
        let Some(knob) = self.knobs.get_mut(&binding.action) else {
            return Vec::new();
        };
        let value = knob.apply_absolute(event.value, event.at);

        let results = self.issue_knob_commands(binding, value).await;
        self.send_knob_led(binding);
        results
    }

    async fn route_relative(
        &mut self,
        binding: &ControlBinding,
        mode: RelativeMode,
        event: ControlEvent,
    ) -> Vec<CommandResult> {
        let Some(knob) = self.knobs.get_mut(&binding.action) else {
            return Vec::new();
        };

        let delta = relative_delta(event.value, mode) * self.encoder_step as i32;
        let old = knob.current();
        let (value, hit_limit) = knob.apply_relative(delta, event.at);

        if value == old {
            // Already pinned at a bound: no command, no LED change
            return Vec::new();
        }
        if hit_limit {
            debug!("{}: hit {} stop", binding.action, if delta > 0 { "max" } else { "min" });
        }

        let results = self.issue_knob_commands(binding, value).await;
        self.send_knob_led(binding);
        results
    }

    async fn route_button(
        &mut self,
        binding: &ControlBinding,
        event: ControlEvent,
    ) -> Vec<CommandResult> {
        let Some(toggle) = self.toggles.get_mut(&binding.action) else {
            return Vec::new();
        };
        if !toggle.press(event.at) {
            debug!("{}: press inside debounce window, ignored", binding.action);
            return Vec::new();
        }
        let on = toggle.current();
        let mut results = Vec::new();

        // Turning a group member on evicts the others first, so the monitor
        // never shows two exclusive modes enabled at once
        if on {
            if let Some(group) = binding.group.clone() {
                let members = self.table.group_members(&group).to_vec();
                for member in members {
                    if member == binding.action {
                        continue;
                    }
                    let evicted = self
                        .toggles
                        .get_mut(&member)
                        .map(|t| t.force_off(event.at))
                        .unwrap_or(false);
                    if !evicted {
                        continue;
                    }
                    if let Some(other) = self.table.get(&member).cloned() {
                        if let Some((code, value)) = other.toggle_command(false) {
                            results.push(self.monitor.set(code, value).await);
                        }
                        self.send_button_led(&other, false);
                        info!("{}: OFF (evicted by {})", member, binding.action);
                    }
                }
            }
        }

        if let Some((code, value)) = binding.toggle_command(on) {
            results.push(self.monitor.set(code, value).await);
        }
        self.send_button_led(binding, on);
        info!("{}: {}", binding.action, if on { "ON" } else { "OFF" });
        results
    }

    async fn issue_knob_commands(
        &mut self,
        binding: &ControlBinding,
        value: u16,
    ) -> Vec<CommandResult> {
        let mut results = Vec::new();
        for (code, v) in binding.knob_commands(value) {
            let result = self.monitor.set(code, v).await;
            if result.outcome == CommandOutcome::Failed {
                warn!(
                    "{}: write to VCP 0x{:02X} failed, continuing",
                    binding.action, code
                );
            }
            results.push(result);
        }
        results
    }

    /// Map a monitor-read command value back to a virtual value for seeding
    fn invert_plan(&self, binding: &ControlBinding, command_value: u16) -> u16 {
        match binding.plan {
            CommandPlan::Linear { scale, offset, .. } if scale != 0.0 => {
                let v = ((command_value as f64 - offset) / scale).round();
                v.clamp(binding.domain.min as f64, binding.domain.max as f64) as u16
            }
            _ => command_value,
        }
    }

    fn send_knob_led(&self, binding: &ControlBinding) {
        if let Some(LedTarget::Ring(index)) = binding.led {
            if let Some(knob) = self.knobs.get(&binding.action) {
                let _ = self.feedback.send(Feedback::Ring {
                    index,
                    position: knob.led_position(),
                });
            }
        }
    }

    fn send_button_led(&self, binding: &ControlBinding, on: bool) {
        if let Some(LedTarget::Note(note)) = binding.led {
            let _ = self.feedback.send(Feedback::Button { note, on });
        }
    }

    #[cfg(test)]
    pub(crate) fn knob_value(&self, action: &str) -> Option<u16> {
        self.knobs.get(action).map(VirtualKnob::current)
    }

    #[cfg(test)]
    pub(crate) fn toggle_value(&self, action: &str) -> Option<bool> {
        self.toggles.get(action).map(Toggle::current)
    }
}
