//! Connection state machine
//!
//! Tracks the lifecycle of a connection from first handshake to close:
//! `Connecting → Connected ⇄ Reconnecting → Draining → Closed`, with
//! `Closed` reachable from any state.

use std::sync::atomic::{AtomicU8, Ordering};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// First handshake in progress, no prior success
    Connecting,
    /// Steady state with a live transport
    Connected,
    /// Transport lost, reconnect loop running
    Reconnecting,
    /// Drain requested; no new work accepted
    Draining,
    /// Terminal state
    Closed,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Reconnecting,
            3 => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Connecting => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Reconnecting => 2,
            ConnectionState::Draining => 3,
            ConnectionState::Closed => 4,
        }
    }
}

/// Atomic cell holding the current [`ConnectionState`]
///
/// Written only by the connection driver; read from any task.
#[derive(Debug)]
pub(crate) struct StateCell {
    raw: AtomicU8,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            raw: AtomicU8::new(ConnectionState::Connecting.as_u8()),
        }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.raw.load(Ordering::Acquire))
    }

    /// Transition to `next` unless already closed
    ///
    /// `Closed` is terminal: once set, no further transition applies.
    pub(crate) fn set(&self, next: ConnectionState) -> bool {
        let mut current = self.raw.load(Ordering::Acquire);
        loop {
            if ConnectionState::from_u8(current) == ConnectionState::Closed {
                return false;
            }
            match self.raw.compare_exchange(
                current,
                next.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.get() == ConnectionState::Closed
    }
}
