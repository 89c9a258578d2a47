//! Connectivity verdict for one editing session.
//!
//! Fuses three signals — host network state, cumulative application-level
//! failures (nack or ack timeout), cumulative transport-level failures —
//! into a single binary `offline` verdict:
//!
//! `offline = host_offline OR app_failures >= 3 OR transport_failures >= 1`
//!
//! Any successful round trip resets both counters and clears the verdict.
//! While offline, automatic reconnection is suppressed until an external
//! event (host back online, or a fresh manual join) re-arms the session.
//! One transport failure is enough: availability is traded for the
//! guarantee that the local fallback path runs instead of silently losing
//! edits.

use serde::{Deserialize, Serialize};

/// App-level failures tolerated before the session is declared offline.
pub const APP_FAILURE_LIMIT: u32 = 3;
/// Transport-level failures tolerated before the session is declared offline.
pub const TRANSPORT_FAILURE_LIMIT: u32 = 1;

/// Client-observable synchronization status.
///
/// Transitions: `Synchronized -> Saving` on flush, `Saving -> Synchronized`
/// on ack, `Saving -> Unsynchronized` on failure or timeout. Disconnect or
/// offline forces `Unsynchronized` immediately without passing through
/// `Saving`. There is no terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Synchronized,
    Saving,
    Unsynchronized,
}

/// Failure-signal fusion with hysteresis.
#[derive(Debug, Clone)]
pub struct ConnectionSupervisor {
    host_online: bool,
    app_failures: u32,
    transport_failures: u32,
    /// Set once the verdict flips offline; cleared only by [`Self::rearm`]
    /// or a successful round trip.
    suppressed: bool,
}

impl Default for ConnectionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSupervisor {
    pub fn new() -> Self {
        Self {
            host_online: true,
            app_failures: 0,
            transport_failures: 0,
            suppressed: false,
        }
    }

    /// Current offline verdict.
    pub fn offline(&self) -> bool {
        !self.host_online
            || self.app_failures >= APP_FAILURE_LIMIT
            || self.transport_failures >= TRANSPORT_FAILURE_LIMIT
    }

    /// Whether automatic reconnection is currently suppressed.
    pub fn reconnect_suppressed(&self) -> bool {
        self.suppressed
    }

    /// A round trip completed successfully: clear counters and hysteresis.
    pub fn record_success(&mut self) {
        self.app_failures = 0;
        self.transport_failures = 0;
        self.suppressed = false;
    }

    /// An ack came back `ok: false` or timed out. Returns the new verdict.
    pub fn record_app_failure(&mut self) -> bool {
        self.app_failures = self.app_failures.saturating_add(1);
        if self.offline() {
            self.suppressed = true;
        }
        self.offline()
    }

    /// The underlying channel errored or dropped. Returns the new verdict.
    pub fn record_transport_failure(&mut self) -> bool {
        self.transport_failures = self.transport_failures.saturating_add(1);
        if self.offline() {
            self.suppressed = true;
        }
        self.offline()
    }

    /// Host-level online/offline event.
    ///
    /// Going online re-arms the session; going offline suppresses it.
    pub fn set_host_online(&mut self, online: bool) {
        self.host_online = online;
        if online {
            self.rearm();
        } else {
            self.suppressed = true;
        }
    }

    /// External re-arm: host came back online or a fresh manual join.
    pub fn rearm(&mut self) {
        self.app_failures = 0;
        self.transport_failures = 0;
        self.suppressed = false;
    }

    pub fn app_failures(&self) -> u32 {
        self.app_failures
    }

    pub fn transport_failures(&self) -> u32 {
        self.transport_failures
    }
}
