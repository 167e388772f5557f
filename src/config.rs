//! Session tuning knobs
//!
//! Defaults match the wire behaviour peers expect: port 5000, a 5 second
//! handshake window and a PING every 5 seconds.

use std::time::Duration;

/// Well-known local port for the handshake listener and chat
pub const DEFAULT_PORT: u16 = 5000;

/// How long the initiator waits for "Hello back!"
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Keep-alive probe period
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Receive job gives up after this much silence
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

/// Presence re-evaluation period
pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration shared by every worker of a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Local UDP port to bind (0 picks an ephemeral port)
    pub local_port: u16,
    /// Bounded wait for the acknowledge token
    pub handshake_timeout: Duration,
    /// Interval between keep-alive probes
    pub keepalive_interval: Duration,
    /// Disconnect when the peer is silent this long (None = never)
    pub idle_timeout: Option<Duration>,
    /// Max gap between datagrams during a file receive
    pub transfer_timeout: Duration,
    /// Presence status re-evaluation interval
    pub status_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            local_port: DEFAULT_PORT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            idle_timeout: None,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
            status_interval: DEFAULT_STATUS_INTERVAL,
        }
    }
}

impl SessionConfig {
    /// Config bound to an ephemeral port with short timers, for loopback tests
    #[cfg(test)]
    pub fn ephemeral() -> Self {
        Self {
            local_port: 0,
            handshake_timeout: Duration::from_millis(500),
            keepalive_interval: Duration::from_millis(50),
            idle_timeout: None,
            transfer_timeout: Duration::from_secs(2),
            status_interval: Duration::from_millis(20),
        }
    }
}
