//! Session lifecycle states.

use std::fmt;

/// Lifecycle state reported to the application.
///
/// ```text
/// Creating -> Connecting -> Connected -> Active <-> Idle -> Disconnecting -> Destroyed
///                 ^   |
///                 |   v
///               Retrying -> AllRetriesFailed
/// ```
///
/// `Timeout` can end the session from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Session allocated, no attempt yet.
    Creating,
    /// A connection attempt is in flight.
    Connecting,
    /// Transport reports the connection up.
    Connected,
    /// Payload is flowing.
    Active,
    /// A message completed and the connection is kept.
    Idle,
    /// A visible attempt failure; another attempt is scheduled.
    Retrying,
    /// Close requested, teardown in progress.
    Disconnecting,
    /// Closed normally.
    Destroyed,
    /// The absolute session timeout fired.
    Timeout,
    /// The retry strategy gave up.
    AllRetriesFailed,
}

impl SessionState {
    /// Whether no further callbacks follow this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed | Self::Timeout | Self::AllRetriesFailed)
    }

    /// Whether payload may be exchanged in this state.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Active | Self::Idle)
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Retrying => "retrying",
            Self::Disconnecting => "disconnecting",
            Self::Destroyed => "destroyed",
            Self::Timeout => "timeout",
            Self::AllRetriesFailed => "all-retries-failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
