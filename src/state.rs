use crate::auth::AuthMethod;
use std::fmt;
use std::sync::Arc;

/// ConnectionState tracks where a single client connection sits in the
/// SOCKS5 lifecycle. Transitions only move forward, except that any
/// state may move to Closed, which is absorbing.
#[derive(Clone)]
pub enum ConnectionState {
    /// Awaiting the client greeting
    NotAuthenticated,
    /// Method chosen, awaiting its sub-negotiation
    WaitingAuthenticationData(Arc<dyn AuthMethod>),
    /// Awaiting the request
    Authenticated,
    /// Upstream open, client bytes are opaque payload
    Connected,
    Closed,
}

impl ConnectionState {
    fn rank(&self) -> u8 {
        match self {
            ConnectionState::NotAuthenticated => 0,
            ConnectionState::WaitingAuthenticationData(_) => 1,
            ConnectionState::Authenticated => 2,
            ConnectionState::Connected => 3,
            ConnectionState::Closed => 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::NotAuthenticated => "not_authenticated",
            ConnectionState::WaitingAuthenticationData(_) => "waiting_authentication_data",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }

    /// can_transition_to reports whether next lies strictly ahead of self
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        next.rank() > self.rank()
    }

    /// is_before orders states along the lifecycle
    pub fn is_before(&self, other: &ConnectionState) -> bool {
        self.rank() < other.rank()
    }
}

impl PartialEq for ConnectionState {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                ConnectionState::WaitingAuthenticationData(a),
                ConnectionState::WaitingAuthenticationData(b),
            ) => a.code() == b.code(),
            _ => self.rank() == other.rank(),
        }
    }
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::WaitingAuthenticationData(method) => {
                write!(f, "WaitingAuthenticationData({method:?})")
            }
            ConnectionState::NotAuthenticated => write!(f, "NotAuthenticated"),
            ConnectionState::Authenticated => write!(f, "Authenticated"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
