//! Session error types

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::session::SessionState;

/// Errors raised by the session core
#[derive(Debug, Error)]
pub enum SessionError {
    /// Peer address string failed validation
    #[error("Invalid peer address {input:?}: {reason}")]
    InvalidAddress { input: String, reason: &'static str },

    /// Required input was blank
    #[error("{0} must not be empty")]
    EmptyInput(&'static str),

    /// Chat text that the peer would read as a control token
    #[error("{0:?} is reserved by the protocol and cannot be sent as chat")]
    ReservedText(String),

    /// Host name did not resolve to a usable address
    #[error("Could not resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    /// No acknowledge token within the handshake window
    #[error("Handshake with {peer} timed out after {timeout:?}")]
    HandshakeTimeout { peer: SocketAddr, timeout: Duration },

    /// Join attempted while another session is live
    #[error("A session is already {0}")]
    AlreadyActive(SessionState),

    /// Operation needs a CONNECTED session
    #[error("Not connected")]
    NotConnected,

    /// Receive job saw no datagram for too long
    #[error("Transfer stalled: no datagram for {0:?}")]
    TransferStalled(Duration),

    /// Socket or file I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// True for input validation failures (no network action was taken)
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidAddress { .. } | Self::EmptyInput(_) | Self::ReservedText(_)
        )
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;
