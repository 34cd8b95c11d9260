//! Per-supplier session state.
//!
//! ```text
//!            ack / probe ok                  N failures / disconnect
//! Pending ────────────────▶ Connected ─────────────────────────────▶ Offline
//!    │                          ▲                                       │
//!    └── N failures ──▶ Offline └──────────── ack / probe ok ───────────┘
//! ```
//!
//! Offline suppliers are probed on an exponential backoff.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SupplierState {
    /// Acknowledged a request recently
    Connected,
    /// Excluded from sending, rebuild and restore planning
    Offline,
    /// Registered, not heard from yet
    Pending,
}

impl SupplierState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupplierState::Connected => "connected",
            SupplierState::Offline => "offline",
            SupplierState::Pending => "pending",
        }
    }

    /// Whether work may be routed to the supplier.
    pub fn is_available(&self) -> bool {
        !matches!(self, SupplierState::Offline)
    }
}

impl fmt::Display for SupplierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session tuning shared by every supplier.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Consecutive failures before a supplier goes offline
    pub failure_threshold: u32,
    /// First probe delay after going offline
    pub probe_backoff_base: Duration,
    /// Probe delay cap
    pub probe_backoff_max: Duration,
    pub probe_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            probe_backoff_base: Duration::from_secs(5),
            probe_backoff_max: Duration::from_secs(600),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupplierSession {
    state: SupplierState,
    consecutive_failures: u32,
    backoff: Duration,
    next_probe: Option<Instant>,
    last_ack: Option<Instant>,
}

impl Default for SupplierSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SupplierSession {
    pub fn new() -> Self {
        Self {
            state: SupplierState::Pending,
            consecutive_failures: 0,
            backoff: Duration::ZERO,
            next_probe: None,
            last_ack: None,
        }
    }

    pub fn state(&self) -> SupplierState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn next_probe(&self) -> Option<Instant> {
        self.next_probe
    }

    pub fn last_ack(&self) -> Option<Instant> {
        self.last_ack
    }

    /// Any successful answer. Returns the new state if it changed.
    pub fn on_ack(&mut self, now: Instant) -> Option<SupplierState> {
        self.consecutive_failures = 0;
        self.backoff = Duration::ZERO;
        self.next_probe = None;
        self.last_ack = Some(now);
        self.transition(SupplierState::Connected)
    }

    /// A failed or timed-out request.
    pub fn on_failure(&mut self, config: &SessionConfig, now: Instant) -> Option<SupplierState> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.state != SupplierState::Offline
            && self.consecutive_failures >= config.failure_threshold
        {
            self.go_offline(config, now)
        } else {
            None
        }
    }

    /// Explicit disconnect.
    pub fn disconnect(&mut self, config: &SessionConfig, now: Instant) -> Option<SupplierState> {
        if self.state == SupplierState::Offline {
            return None;
        }
        self.go_offline(config, now)
    }

    pub fn probe_due(&self, now: Instant) -> bool {
        self.state == SupplierState::Offline && self.next_probe.map_or(true, |at| at <= now)
    }

    /// Double the probe delay, capped.
    pub fn on_probe_failed(&mut self, config: &SessionConfig, now: Instant) {
        self.backoff = (self.backoff * 2)
            .max(config.probe_backoff_base)
            .min(config.probe_backoff_max);
        self.next_probe = Some(now + self.backoff);
    }

    fn go_offline(&mut self, config: &SessionConfig, now: Instant) -> Option<SupplierState> {
        self.backoff = config.probe_backoff_base.min(config.probe_backoff_max);
        self.next_probe = Some(now + self.backoff);
        self.transition(SupplierState::Offline)
    }

    fn transition(&mut self, state: SupplierState) -> Option<SupplierState> {
        if self.state == state {
            None
        } else {
            self.state = state;
            Some(state)
        }
    }
}
