//! Reconnect controller.
//!
//! A pure state machine: it performs no I/O and owns no timers. The
//! transport manager reports connection outcomes and acts on the returned
//! [`Decision`].
//!
//! ```text
//! Disconnected ─start─► Connecting(m) ─ok─► Connected(m)
//!                          │                   │ closed / error
//!                          │ failed            ▼
//!                          └──────────────► Degrading ─next mechanism─► Connecting(m')
//!                                              │ list exhausted
//!                                              ▼
//!                                           Failed ─backoff─► Connecting(first)
//!                                              │ ceiling reached
//!                                              ▼
//!                                           Failed (suspended until resume)
//! ```
//!
//! Within a cycle the cursor only moves down the mechanism list, so a failed
//! mechanism is never retried before the lower ones have been tried. Only a
//! cycle that ends without a single successful connection counts toward the
//! backoff and the ceiling.

use crate::error::{SyncError, SyncResult};
use crate::transport::Mechanism;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Backoff and ceiling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay after the first failed cycle (ms).
    pub base_delay_ms: u64,
    /// Upper bound on the delay (ms).
    pub max_delay_ms: u64,
    /// Consecutive failed cycles before auto-retry stops.
    pub max_failed_cycles: u32,
    /// Time allowed for one connection attempt (ms).
    pub connect_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_failed_cycles: 5,
            connect_timeout_ms: 10_000,
        }
    }
}

impl ReconnectConfig {
    /// `base * 2^attempt`, capped at `max_delay_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Connection state as observed by the rest of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "mechanism", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting(Mechanism),
    Connected(Mechanism),
    Degrading,
    Failed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }

    /// The active or pending mechanism, if any.
    pub fn mechanism(&self) -> Option<Mechanism> {
        match self {
            ConnectionState::Connecting(m) | ConnectionState::Connected(m) => Some(*m),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting(m) => write!(f, "connecting({m})"),
            ConnectionState::Connected(m) => write!(f, "connected({m})"),
            ConnectionState::Degrading => f.write_str("degrading"),
            ConnectionState::Failed => f.write_str("failed"),
        }
    }
}

/// What the transport manager should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Attempt this mechanism now.
    Try(Mechanism),
    /// Wait, then call [`ReconnectController::retry`].
    RetryAfter(Duration),
    /// Stop until [`ReconnectController::resume`] is called.
    Suspend,
}

/// Drives mechanism selection and backoff.
#[derive(Debug, Clone)]
pub struct ReconnectController {
    config: ReconnectConfig,
    mechanisms: Vec<Mechanism>,
    state: ConnectionState,
    /// Index of the mechanism being tried or used.
    cursor: usize,
    /// Consecutive cycles without a successful connection.
    attempt: u32,
    /// A connection succeeded during the current cycle.
    connected_this_cycle: bool,
    suspended: bool,
}

impl ReconnectController {
    pub fn new(config: ReconnectConfig, mechanisms: Vec<Mechanism>) -> SyncResult<Self> {
        if mechanisms.is_empty() {
            return Err(SyncError::Config("no live-update mechanisms enabled".to_string()));
        }
        let mut seen = Vec::with_capacity(mechanisms.len());
        for m in mechanisms {
            if !seen.contains(&m) {
                seen.push(m);
            }
        }
        Ok(Self {
            config,
            mechanisms: seen,
            state: ConnectionState::Disconnected,
            cursor: 0,
            attempt: 0,
            connected_this_cycle: false,
            suspended: false,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn mechanisms(&self) -> &[Mechanism] {
        &self.mechanisms
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    fn begin_cycle(&mut self) -> Decision {
        self.cursor = 0;
        self.connected_this_cycle = false;
        let first = self.mechanisms[0];
        self.state = ConnectionState::Connecting(first);
        Decision::Try(first)
    }

    /// Starts connecting from the top of the list.
    pub fn start(&mut self) -> Decision {
        self.suspended = false;
        self.begin_cycle()
    }

    /// Called when the backoff delay has elapsed.
    pub fn retry(&mut self) -> Decision {
        if self.suspended {
            return Decision::Suspend;
        }
        debug!("Reconnect cycle {} starting", self.attempt + 1);
        self.begin_cycle()
    }

    /// External trigger (e.g. connectivity regained). Clears the ceiling and
    /// the backoff, then starts a fresh cycle.
    pub fn resume(&mut self) -> Decision {
        if self.suspended {
            info!("Reconnect resumed after suspension");
        }
        self.suspended = false;
        self.attempt = 0;
        self.begin_cycle()
    }

    /// Marks the connection as established.
    pub fn on_connected(&mut self, mechanism: Mechanism) {
        if let Some(pos) = self.mechanisms.iter().position(|m| *m == mechanism) {
            self.cursor = pos;
        }
        self.attempt = 0;
        self.connected_this_cycle = true;
        self.suspended = false;
        self.state = ConnectionState::Connected(mechanism);
    }

    /// Reports a failed attempt or a lost connection on the current
    /// mechanism.
    pub fn on_failure(&mut self) -> Decision {
        if self.cursor + 1 < self.mechanisms.len() {
            self.cursor += 1;
            let next = self.mechanisms[self.cursor];
            self.state = ConnectionState::Degrading;
            debug!("Degrading to {}", next);
            return Decision::Try(next);
        }

        self.state = ConnectionState::Failed;
        if self.connected_this_cycle {
            // Not a failed cycle: the last mechanism worked for a while.
            let delay = self.config.backoff(0);
            debug!("Mechanism list exhausted after a good connection, restarting in {:?}", delay);
            return Decision::RetryAfter(delay);
        }

        let delay = self.config.backoff(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        if self.attempt >= self.config.max_failed_cycles.max(1) {
            self.suspended = true;
            warn!(
                "All mechanisms failed {} cycle(s) in a row, suspending reconnects",
                self.attempt
            );
            return Decision::Suspend;
        }
        info!(
            "All mechanisms failed (cycle {}), retrying in {:?}",
            self.attempt, delay
        );
        Decision::RetryAfter(delay)
    }

    /// Marks the state as `Connecting` for the mechanism about to be tried.
    pub fn on_attempt(&mut self, mechanism: Mechanism) {
        self.state = ConnectionState::Connecting(mechanism);
    }

    /// Resets everything after an explicit disconnect.
    pub fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.cursor = 0;
        self.attempt = 0;
        self.connected_this_cycle = false;
        self.suspended = false;
    }
}
