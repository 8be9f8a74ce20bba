//! Monitor command interface
//!
//! Single point of contact with the DDC/CI transport. Owns the connection
//! handle, a last-known-value cache per VCP code (write-on-change), the
//! per-session unsupported-code set, and bounded retry with exponential
//! backoff. No other component touches the transport.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use ddc_hi::Ddc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Failure from the underlying DDC/CI transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// The monitor replied that it does not implement this VCP code
    #[error("VCP code not supported by the monitor")]
    Unsupported,

    /// Retryable I2C/DDC failure
    #[error("transport error: {0}")]
    Io(String),
}

/// Startup-fatal monitor errors
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("no DDC/CI-capable monitor found{0}")]
    NoMonitorFound(String),
}

/// Transport seam: implemented over `ddc_hi` in production and by a scripted
/// mock in tests
pub trait VcpTransport: Send {
    fn set_vcp(&mut self, code: u8, value: u16) -> Result<(), TransportError>;
    fn get_vcp(&mut self, code: u8) -> Result<u16, TransportError>;
    fn describe(&self) -> String;
}

/// DDC/CI transport over a `ddc_hi::Display`
pub struct DdcTransport {
    display: ddc_hi::Display,
}

impl DdcTransport {
    /// Enumerate displays and open the first one matching `model_match`
    /// (case-insensitive substring of the display id or model name), or the
    /// first display found when no pattern is configured.
    pub fn open(model_match: Option<&str>) -> Result<Self, MonitorError> {
        let mut displays = ddc_hi::Display::enumerate();
        let pattern = model_match.map(|p| p.to_lowercase());

        let position = displays.iter().position(|d| match &pattern {
            Some(p) => {
                d.info.id.to_lowercase().contains(p)
                    || d.info
                        .model_name
                        .as_deref()
                        .map(|m| m.to_lowercase().contains(p))
                        .unwrap_or(false)
            }
            None => true,
        });

        match position {
            Some(idx) => {
                let selected = displays.swap_remove(idx);
                info!("Using monitor: {}", selected.info.id);
                Ok(Self { display: selected })
            }
            None => {
                let hint = match model_match {
                    Some(p) => format!(" matching '{}' ({} displays seen)", p, displays.len()),
                    None => String::new(),
                };
                Err(MonitorError::NoMonitorFound(hint))
            }
        }
    }
}

impl VcpTransport for DdcTransport {
    fn set_vcp(&mut self, code: u8, value: u16) -> Result<(), TransportError> {
        self.display
            .handle
            .set_vcp_feature(code, value)
            .map_err(classify_ddc_error)
    }

    fn get_vcp(&mut self, code: u8) -> Result<u16, TransportError> {
        self.display
            .handle
            .get_vcp_feature(code)
            .map(|v| v.value())
            .map_err(classify_ddc_error)
    }

    fn describe(&self) -> String {
        self.display.info.id.clone()
    }
}

/// The DDC/CI reply for an unimplemented VCP code reaches us folded into the
/// same error type as bus failures; recover the distinction from the error
/// text so such codes get excluded for the session instead of retried on
/// every command.
fn classify_ddc_error(err: impl std::fmt::Display) -> TransportError {
    let msg = err.to_string();
    if msg.to_lowercase().contains("unsupported") {
        TransportError::Unsupported
    } else {
        TransportError::Io(msg)
    }
}

/// Outcome of a single `set`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Written to the transport
    Applied,
    /// Requested value equals the cached value; no transport call made
    SkippedNoChange,
    /// Code marked unsupported this session; no transport call made
    SkippedUnsupported,
    /// Retries exhausted; caller logs and continues
    Failed,
}

/// Result of one command, transient
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandResult {
    pub code: u8,
    pub value: u16,
    pub outcome: CommandOutcome,
}

/// Bounded exponential backoff parameters
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, first try included
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): base, 2*base, 4*base...
    fn delay(&self, retry: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(retry)
    }
}

/// Retrying, write-on-change command interface to one monitor
pub struct MonitorCommands {
    transport: Box<dyn VcpTransport>,
    retry: RetryPolicy,
    /// Last known value per VCP code, seeded by the probe, updated on writes
    cache: HashMap<u8, u16>,
    /// Codes excluded for the session after an unsupported reply
    unsupported: HashSet<u8>,
}

impl MonitorCommands {
    pub fn new(transport: Box<dyn VcpTransport>, retry: RetryPolicy) -> Self {
        Self {
            transport,
            // A zero-attempt policy would fail every command without ever
            // touching the transport
            retry: RetryPolicy {
                attempts: retry.attempts.max(1),
                ..retry
            },
            cache: HashMap::new(),
            unsupported: HashSet::new(),
        }
    }

    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    /// Last known value for a code, if any
    pub fn cached(&self, code: u8) -> Option<u16> {
        self.cache.get(&code).copied()
    }

    pub fn is_supported(&self, code: u8) -> bool {
        !self.unsupported.contains(&code)
    }

    /// Write `value` to `code`, suppressing redundant writes and retrying
    /// transient failures. Never returns an error: exhausted retries become a
    /// `Failed` outcome and the engine keeps running.
    pub async fn set(&mut self, code: u8, value: u16) -> CommandResult {
        let result = |outcome| CommandResult { code, value, outcome };

        if self.unsupported.contains(&code) {
            debug!("VCP 0x{:02X}: skipped (unsupported this session)", code);
            return result(CommandOutcome::SkippedUnsupported);
        }

        if self.cache.get(&code) == Some(&value) {
            debug!("VCP 0x{:02X}: skipped, already at {}", code, value);
            return result(CommandOutcome::SkippedNoChange);
        }

        for attempt in 0..self.retry.attempts {
            match self.transport.set_vcp(code, value) {
                Ok(()) => {
                    self.cache.insert(code, value);
                    debug!("VCP 0x{:02X} <- {}", code, value);
                    return result(CommandOutcome::Applied);
                }
                Err(TransportError::Unsupported) => {
                    warn!(
                        "VCP 0x{:02X} not supported by {}; disabling for this session",
                        code,
                        self.transport.describe()
                    );
                    self.unsupported.insert(code);
                    return result(CommandOutcome::SkippedUnsupported);
                }
                Err(TransportError::Io(e)) => {
                    let retries_left = self.retry.attempts - attempt - 1;
                    if retries_left > 0 {
                        let delay = self.retry.delay(attempt);
                        debug!(
                            "VCP 0x{:02X} write failed ({}), retrying in {:?}",
                            code, e, delay
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        warn!(
                            "VCP 0x{:02X} write failed after {} attempts: {}",
                            code, self.retry.attempts, e
                        );
                    }
                }
            }
        }

        result(CommandOutcome::Failed)
    }

    /// Read the current value of `code`.
    ///
    /// `Ok(None)` means the monitor does not support the code (now marked for
    /// the session); `Err` is a transport failure after retries, which leaves
    /// the code enabled.
    pub async fn get(&mut self, code: u8) -> Result<Option<u16>, TransportError> {
        if self.unsupported.contains(&code) {
            return Ok(None);
        }

        let mut last_err = TransportError::Io("no attempt made".to_string());
        for attempt in 0..self.retry.attempts {
            match self.transport.get_vcp(code) {
                Ok(value) => {
                    self.cache.insert(code, value);
                    return Ok(Some(value));
                }
                Err(TransportError::Unsupported) => {
                    self.unsupported.insert(code);
                    return Ok(None);
                }
                Err(err) => {
                    last_err = err;
                    let retries_left = self.retry.attempts - attempt - 1;
                    if retries_left > 0 {
                        tokio::time::sleep(self.retry.delay(attempt)).await;
                    }
                }
            }
        }

        Err(last_err)
    }

    /// One-shot startup capability probe.
    ///
    /// Reads every configured code once: supported codes seed the cache,
    /// unsupported codes are excluded for the session with a one-time notice.
    /// A probe read that fails in transport leaves the code enabled; the
    /// first successful write will fill its cache slot. Returns the number of
    /// codes confirmed supported.
    pub async fn probe(&mut self, codes: &[u8]) -> usize {
        let mut supported = 0;

        for &code in codes {
            match self.get(code).await {
                Ok(Some(value)) => {
                    debug!("VCP 0x{:02X} = {}", code, value);
                    supported += 1;
                }
                Ok(None) => {
                    warn!(
                        "VCP 0x{:02X} not supported by {}; disabled for this session",
                        code,
                        self.transport.describe()
                    );
                }
                Err(e) => {
                    warn!("VCP 0x{:02X} probe read failed ({}); leaving enabled", code, e);
                }
            }
        }

        info!(
            "Capability probe: {}/{} codes supported on {}",
            supported,
            codes.len(),
            self.transport.describe()
        );
        supported
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted in-memory transport for unit tests

    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Default)]
    pub struct MockState {
        /// Current VCP values; `get_vcp` on a missing code is an I/O error
        pub values: HashMap<u8, u16>,
        /// Codes the mock monitor does not implement
        pub unsupported: HashSet<u8>,
        /// Inject this many I/O failures into upcoming set calls
        pub fail_sets: u32,
        /// Inject this many I/O failures into upcoming get calls
        pub fail_gets: u32,
        /// Every set_vcp invocation, failures included
        pub set_calls: Vec<(u8, u16)>,
        /// Every get_vcp invocation
        pub get_calls: Vec<u8>,
    }

    pub struct MockTransport(pub Arc<Mutex<MockState>>);

    impl VcpTransport for MockTransport {
        fn set_vcp(&mut self, code: u8, value: u16) -> Result<(), TransportError> {
            let mut state = self.0.lock();
            state.set_calls.push((code, value));
            if state.unsupported.contains(&code) {
                return Err(TransportError::Unsupported);
            }
            if state.fail_sets > 0 {
                state.fail_sets -= 1;
                return Err(TransportError::Io("injected failure".to_string()));
            }
            state.values.insert(code, value);
            Ok(())
        }

        fn get_vcp(&mut self, code: u8) -> Result<u16, TransportError> {
            let mut state = self.0.lock();
            state.get_calls.push(code);
            if state.unsupported.contains(&code) {
                return Err(TransportError::Unsupported);
            }
            if state.fail_gets > 0 {
                state.fail_gets -= 1;
                return Err(TransportError::Io("injected failure".to_string()));
            }
            state
                .values
                .get(&code)
                .copied()
                .ok_or_else(|| TransportError::Io("no value".to_string()))
        }

        fn describe(&self) -> String {
            "mock monitor".to_string()
        }
    }

    /// Build a mock-backed command interface with zero backoff delay
    pub fn commands() -> (MonitorCommands, Arc<Mutex<MockState>>) {
        let state = Arc::new(Mutex::new(MockState::default()));
        let transport = MockTransport(state.clone());
        let retry = RetryPolicy {
            attempts: 3,
            base_delay: Duration::ZERO,
        };
        (MonitorCommands::new(Box::new(transport), retry), state)
    }
}
