//! Caller-facing handles over a live connection
//!
//! [`Sender`] issues commands, [`FaultHandle`] reports what went wrong. Both
//! point at the same connection and can live on different threads. Tearing
//! down through either one closes the connection for both; every call made
//! afterwards gets a defined "closed" answer.

use std::fmt;
use std::sync::Arc;

use super::commands::Command;
use super::connection::{ConnectionState, Link, SpeedLimits};
use super::ErrorKind;

/// Command-submission half of a connection
#[derive(Clone)]
pub struct Sender {
    link: Arc<Link>,
}

impl Sender {
    pub(crate) fn new(link: Arc<Link>) -> Self {
        Self { link }
    }

    /// Ask the motor to run at `speed`.
    ///
    /// Returns immediately. `true` means the command was written to the device;
    /// its acknowledgment arrives later on the link thread. `false` means it was
    /// not sent: the previous command is still unacknowledged, `speed` is outside
    /// [`limits`](Self::limits), or the connection failed or was torn down.
    /// Callers retry after a pause and watch
    /// [`FaultHandle::current_error`] for failures.
    pub fn submit_speed(&self, speed: i16) -> bool {
        if self.link.is_released() {
            return false;
        }
        let shared = self.link.shared();
        if !shared.is_alive() {
            return false;
        }
        if !shared.limits.contains(speed) {
            tracing::debug!(
                "speed {} outside accepted range {}..={}",
                speed,
                shared.limits.min,
                shared.limits.max
            );
            return false;
        }
        shared.try_send(|seq| Command::SetSpeed { seq, speed })
    }

    /// Speed range accepted by the connected device
    pub fn limits(&self) -> SpeedLimits {
        self.link.shared().limits
    }

    /// Whether commands can still be submitted
    pub fn is_connected(&self) -> bool {
        self.link.state() == ConnectionState::Connected
    }

    /// Close the connection. Safe to call any number of times, from either handle.
    pub fn teardown(&self) {
        self.link.teardown();
    }
}

impl fmt::Debug for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("state", &self.link.state())
            .finish_non_exhaustive()
    }
}

/// Error-reporting half of a connection
#[derive(Clone)]
pub struct FaultHandle {
    link: Arc<Link>,
}

impl FaultHandle {
    pub(crate) fn new(link: Arc<Link>) -> Self {
        Self { link }
    }

    /// Latest error seen on the connection, [`ErrorKind::Ok`] if none.
    ///
    /// Never blocks. Once a failure is reported it stays reported.
    pub fn current_error(&self) -> ErrorKind {
        self.link.shared().latch.get()
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    /// Protocol version negotiated with the device
    pub fn version(&self) -> u16 {
        self.link.shared().version
    }

    /// Get cumulative tx/rx bytes and packet counters
    pub fn counters(&self) -> (u64, u64, u64, u64) {
        self.link.shared().counters()
    }

    /// Number of speed commands the device refused after receiving them
    pub fn rejected_commands(&self) -> u64 {
        self.link.shared().rejected()
    }

    /// Close the connection. Safe to call any number of times, from either handle.
    pub fn teardown(&self) {
        self.link.teardown();
    }
}

impl fmt::Debug for FaultHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultHandle")
            .field("state", &self.link.state())
            .field("error", &self.current_error())
            .finish_non_exhaustive()
    }
}
