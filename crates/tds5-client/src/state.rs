//! Connection state tracking.
//!
//! ## State Transitions
//!
//! ```text
//! Closed -> Connecting (via connect())
//! Connecting -> Open (via a successful login response)
//! Open -> Executing (request being sent)
//! Executing -> Fetching (response being read)
//! Fetching -> Open (end of response, or cancellation acknowledged)
//! any -> Broken (protocol failure or lost connection)
//! any -> Closed (via close())
//! ```

use std::fmt;

/// Runtime state of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No transport.
    #[default]
    Closed,
    /// Transport open, login not yet acknowledged.
    Connecting,
    /// Logged in and idle.
    Open,
    /// A request is being written.
    Executing,
    /// A response is being read.
    Fetching,
    /// The byte stream can no longer be trusted; only `close()` is allowed.
    Broken,
}

impl ConnectionState {
    /// Check if the connection can accept a new request.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Check if a request is in flight.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Executing | Self::Fetching)
    }

    /// Check if a transport is attached.
    #[must_use]
    pub fn has_transport(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Executing => "executing",
            Self::Fetching => "fetching",
            Self::Broken => "broken",
        };
        f.write_str(name)
    }
}
