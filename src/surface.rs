//! MIDI control surface driver
//!
//! Handles MIDI communication with the hardware surface: the input side
//! parses incoming bytes into control events and hands them to a channel,
//! the output side drives encoder LED rings and button LEDs from mapper
//! feedback.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use midir::{MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use parking_lot::Mutex;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::mapper::Feedback;
use crate::midi::{format_hex, ControlEvent, MidiMessage};

/// Base CC for the encoder LED rings (CC 48-55, one per encoder)
const RING_CC_BASE: u8 = 48;

/// Surface driver for hardware communication
pub struct SurfaceDriver {
    input_conn: Option<MidiInputConnection<()>>,
    output: Option<SurfaceOutput>,

    /// Sender handed to the input callback
    event_tx: mpsc::Sender<ControlEvent>,

    /// Receiver for the dispatch loop, taken once
    event_rx: Option<mpsc::Receiver<ControlEvent>>,

    input_port_name: String,
    output_port_name: String,
}

/// Cloneable handle to the MIDI output connection
#[derive(Clone)]
pub struct SurfaceOutput {
    conn: Arc<Mutex<MidiOutputConnection>>,
}

impl SurfaceDriver {
    pub fn new(input_port: &str, output_port: &str) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1000);

        Self {
            input_conn: None,
            output: None,
            event_tx,
            event_rx: Some(event_rx),
            input_port_name: input_port.to_string(),
            output_port_name: output_port.to_string(),
        }
    }

    /// List available MIDI input ports
    pub fn list_input_ports() -> Result<Vec<String>> {
        let midi_in = MidiInput::new("ddc-gw-scanner")?;

        let mut port_names = Vec::new();
        for port in midi_in.ports() {
            if let Ok(name) = midi_in.port_name(&port) {
                port_names.push(name);
            }
        }

        Ok(port_names)
    }

    /// List available MIDI output ports
    pub fn list_output_ports() -> Result<Vec<String>> {
        let midi_out = MidiOutput::new("ddc-gw-scanner")?;

        let mut port_names = Vec::new();
        for port in midi_out.ports() {
            if let Ok(name) = midi_out.port_name(&port) {
                port_names.push(name);
            }
        }

        Ok(port_names)
    }

    /// Find an input port by substring match (Windows-friendly)
    fn find_input_port(
        midi_in: &MidiInput,
        pattern: &str,
    ) -> Option<(midir::MidiInputPort, String)> {
        for port in midi_in.ports() {
            if let Ok(name) = midi_in.port_name(&port) {
                if name.to_lowercase().contains(&pattern.to_lowercase()) {
                    debug!("Found port '{}' matching pattern '{}'", name, pattern);
                    return Some((port, name));
                }
            }
        }
        None
    }

    /// Find an output port by substring match (Windows-friendly)
    fn find_output_port(
        midi_out: &MidiOutput,
        pattern: &str,
    ) -> Option<(midir::MidiOutputPort, String)> {
        for port in midi_out.ports() {
            if let Ok(name) = midi_out.port_name(&port) {
                if name.to_lowercase().contains(&pattern.to_lowercase()) {
                    debug!("Found port '{}' matching pattern '{}'", name, pattern);
                    return Some((port, name));
                }
            }
        }
        None
    }

    /// Connect to the surface MIDI ports
    pub fn connect(&mut self) -> Result<()> {
        self.disconnect();

        info!(
            "Connecting to surface - Input: '{}', Output: '{}'",
            self.input_port_name, self.output_port_name
        );

        let midi_in = MidiInput::new("ddc-gw-input").context("Failed to create MIDI input")?;
        debug!("Found {} MIDI input ports", midi_in.port_count());

        let (in_port, port_name) = Self::find_input_port(&midi_in, &self.input_port_name)
            .ok_or_else(|| anyhow::anyhow!("Input port '{}' not found", self.input_port_name))?;

        info!("Connecting to input port: {}", port_name);

        let event_tx = self.event_tx.clone();
        let input_conn = midi_in
            .connect(
                &in_port,
                "ddc-gw",
                move |_timestamp, data, _| {
                    let at = Instant::now();

                    if let Some(message) = MidiMessage::parse(data) {
                        if let Some(event) = ControlEvent::from_message(&message, at) {
                            // Never block inside the midir callback
                            let _ = event_tx.try_send(event);
                        }
                    } else {
                        debug!("Ignoring MIDI: {}", format_hex(data));
                    }
                },
                (),
            )
            .map_err(|e| anyhow::anyhow!(e.to_string()))
            .context("Failed to connect to input port")?;

        self.input_conn = Some(input_conn);

        let midi_out = MidiOutput::new("ddc-gw-output").context("Failed to create MIDI output")?;
        debug!("Found {} MIDI output ports", midi_out.port_count());

        let (out_port, port_name) = Self::find_output_port(&midi_out, &self.output_port_name)
            .ok_or_else(|| anyhow::anyhow!("Output port '{}' not found", self.output_port_name))?;

        info!("Connecting to output port: {}", port_name);

        let output_conn = midi_out
            .connect(&out_port, "ddc-gw")
            .map_err(|e| anyhow::anyhow!(e.to_string()))
            .context("Failed to connect to output port")?;

        self.output = Some(SurfaceOutput {
            conn: Arc::new(Mutex::new(output_conn)),
        });

        info!("Surface connected");
        Ok(())
    }

    /// Disconnect from MIDI ports
    pub fn disconnect(&mut self) {
        if self.input_conn.take().is_some() || self.output.take().is_some() {
            info!("Surface disconnected");
        }
    }

    /// Take the event receiver (for the dispatch loop to consume)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ControlEvent>> {
        self.event_rx.take()
    }

    /// Handle to the output side, for the feedback forwarder
    pub fn output(&self) -> Option<SurfaceOutput> {
        self.output.clone()
    }
}

impl SurfaceOutput {
    /// Send a MIDI message to the surface
    pub fn send(&self, message: &MidiMessage) -> Result<()> {
        let data = message.encode();

        let mut conn = self.conn.lock();
        conn.send(&data).context("Failed to send MIDI message")?;

        debug!("Sent: {} | {}", format_hex(&data), message);
        Ok(())
    }

    /// Light an encoder LED ring to a position (0-11)
    pub fn set_ring(&self, encoder: u8, position: u8) -> Result<()> {
        if encoder > 7 {
            bail!("Invalid encoder number: {} (must be 0-7)", encoder);
        }

        let message = MidiMessage::ControlChange {
            channel: 0,
            cc: RING_CC_BASE + encoder,
            value: position.min(11),
        };

        self.send(&message)
    }

    /// Set a button LED state
    pub fn set_button_led(&self, note: u8, on: bool) -> Result<()> {
        let message = if on {
            MidiMessage::NoteOn {
                channel: 0,
                note,
                velocity: 127,
            }
        } else {
            MidiMessage::NoteOff {
                channel: 0,
                note,
                velocity: 0,
            }
        };

        self.send(&message)
    }

    /// Forward mapper feedback to surface LEDs until the channel closes
    pub fn spawn_feedback(self, mut feedback: mpsc::UnboundedReceiver<Feedback>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(item) = feedback.recv().await {
                let result = match item {
                    Feedback::Ring { index, position } => self.set_ring(index, position),
                    Feedback::Button { note, on } => self.set_button_led(note, on),
                };
                if let Err(err) = result {
                    warn!("Surface feedback failed: {:#}", err);
                }
            }
            debug!("Feedback forwarder stopped");
        })
    }
}
