//! Tunnel session state machine and the single-use accept gate.
//!
//! Both are plain values driven by explicit events and timestamps so every
//! transition can be checked without sockets.

use std::fmt;
use std::time::{Duration, Instant};

/// Why a session reached [`SessionState::Closed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The piped local connection ended
    ClientDisconnected,
    /// No local client connected within the grace window
    AcceptTimeout,
    /// The process was asked to terminate
    Terminated,
    /// The transport could not be established
    EstablishFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Connecting,
    WaitingForLocalClient { since: Instant },
    Piping { since: Instant },
    Closed(CloseReason),
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Start,
    Connected,
    ConnectFailed,
    ClientAccepted,
    GraceExpired,
    PipeClosed,
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: SessionState,
    pub event: SessionEvent,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event {:?} is not valid in state {}", self.event, self.from)
    }
}

impl std::error::Error for InvalidTransition {}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Init => write!(f, "Init"),
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::WaitingForLocalClient { .. } => write!(f, "WaitingForLocalClient"),
            SessionState::Piping { .. } => write!(f, "Piping"),
            SessionState::Closed(reason) => write!(f, "Closed({:?})", reason),
        }
    }
}

impl SessionState {
    /// Apply `event` at time `now`.
    pub fn on(self, event: SessionEvent, now: Instant) -> Result<SessionState, InvalidTransition> {
        use SessionEvent::*;
        use SessionState::*;

        let next = match (self, event) {
            (Init, Start) => Connecting,
            (Connecting, Connected) => WaitingForLocalClient { since: now },
            (Connecting, ConnectFailed) => Closed(CloseReason::EstablishFailed),
            (WaitingForLocalClient { .. }, ClientAccepted) => Piping { since: now },
            (WaitingForLocalClient { .. }, GraceExpired) => Closed(CloseReason::AcceptTimeout),
            (Piping { .. }, PipeClosed) => Closed(CloseReason::ClientDisconnected),
            (Closed(_), _) => return Err(InvalidTransition { from: self, event }),
            (_, Terminate) => Closed(CloseReason::Terminated),
            _ => return Err(InvalidTransition { from: self, event }),
        };
        Ok(next)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed(_))
    }
}

/// Decision for one incoming local connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The session's own connection
    First,
    /// Let in during the extended accept window
    Extra,
    /// Close this connection, keep listening
    Refused,
    /// Close this connection and stop listening for good
    Closed,
}

/// Enforces single use of the local listener.
///
/// The first connection is always admitted. Later ones are refused unless an
/// extended window was configured, in which case they are admitted until the
/// window (measured from the first acceptance) elapses; after that the
/// listener is closed.
#[derive(Debug, Clone)]
pub struct AcceptGate {
    extended_window: Option<Duration>,
    first_accepted_at: Option<Instant>,
    closed: bool,
}

impl AcceptGate {
    pub fn new(extended_window: Option<Duration>) -> Self {
        Self {
            extended_window,
            first_accepted_at: None,
            closed: false,
        }
    }

    pub fn admit(&mut self, now: Instant) -> Admission {
        if self.closed {
            return Admission::Closed;
        }
        let first = match self.first_accepted_at {
            None => {
                self.first_accepted_at = Some(now);
                return Admission::First;
            }
            Some(first) => first,
        };
        match self.extended_window {
            None => Admission::Refused,
            Some(window) if now.saturating_duration_since(first) <= window => Admission::Extra,
            Some(_) => {
                self.closed = true;
                Admission::Closed
            }
        }
    }

    pub fn first_accepted_at(&self) -> Option<Instant> {
        self.first_accepted_at
    }

    /// When the listener has to stop accepting, once that is known
    pub fn closes_at(&self) -> Option<Instant> {
        Some(self.first_accepted_at? + self.extended_window?)
    }
}
