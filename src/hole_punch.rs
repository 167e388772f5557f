//! UDP Hole Punching Handshake
//!
//! Both peers bind the same well-known local port and exchange two tokens:
//!
//! 1. The initiator sends `Hello` to the peer's public endpoint. The outbound
//!    datagram creates the NAT mapping on the initiator's side.
//! 2. The listener answers any `Hello` with `Hello back!` addressed to the
//!    datagram's source, which opens its own mapping, and becomes CONNECTED.
//! 3. The initiator becomes CONNECTED on `Hello back!` from the expected peer.
//!
//! The protocol is symmetric: an initiator that receives `Hello` from the
//! peer it is punching towards acknowledges it and completes immediately, so
//! two peers joining each other at the same time both succeed.
//!
//! Only the exact acknowledge token completes the handshake. Anything else
//! seen while PUNCHING is ignored so late or duplicate requests are harmless.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{SessionError, SessionResult};
use crate::protocol::{HANDSHAKE_ACK, HANDSHAKE_REQUEST};
use crate::session::{HandshakeEvent, Session};

/// How often the initiator repeats `Hello` inside the handshake window
const PUNCH_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Peer endpoint as typed by the user: `host:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl FromStr for PeerAddress {
    type Err = SessionError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| SessionError::InvalidAddress {
            input: input.to_string(),
            reason,
        };

        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(SessionError::EmptyInput("peer address"));
        }

        let (host, port) = trimmed.rsplit_once(':').ok_or_else(|| invalid("missing :port"))?;

        // [v6]:port
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        if host.contains(':') && !trimmed.starts_with('[') {
            return Err(invalid("IPv6 hosts must be bracketed"));
        }

        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("port is not a number"));
        }
        let port: u32 = port.parse().map_err(|_| invalid("port out of range"))?;
        if !(1..=65535).contains(&port) {
            return Err(invalid("port out of range"));
        }

        Ok(Self {
            host: host.to_string(),
            port: port as u16,
        })
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl PeerAddress {
    /// Resolve to an IPv4 socket address (the session socket is IPv4)
    pub async fn resolve(&self) -> SessionResult<SocketAddr> {
        let resolve_error = |reason: String| SessionError::Resolve {
            host: self.host.clone(),
            reason,
        };

        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| resolve_error(e.to_string()))?;

        addrs
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| resolve_error("no IPv4 address".to_string()))
    }
}

/// Validate `input` and punch towards it
pub async fn join(session: &Session, input: &str) -> SessionResult<SocketAddr> {
    let peer: PeerAddress = input.parse()?;
    initiate(session, &peer).await
}

/// Active side: send `Hello` and wait for `Hello back!`
///
/// Fails with `HandshakeTimeout` when nothing arrives within the configured
/// window; the session is then DISCONNECTED and may be joined again.
pub async fn initiate(session: &Session, peer: &PeerAddress) -> SessionResult<SocketAddr> {
    let target = peer.resolve().await?;
    let timeout = session.config().handshake_timeout;

    let socket = session.begin_punching()?;
    let mut events = session.install_handshake_route();

    info!("🚀 Punching towards {} ({}) from port {}...", peer, target, session.config().local_port);

    let deadline = Instant::now() + timeout;
    let mut next_hello = Instant::now();
    let mut attempts = 0u32;

    let outcome = loop {
        if Instant::now() >= next_hello {
            attempts += 1;
            if let Err(e) = socket.send_to(HANDSHAKE_REQUEST, target).await {
                break Err(SessionError::Io(e));
            }
            debug!("Sent Hello #{} to {}", attempts, target);
            next_hello += PUNCH_RETRY_INTERVAL;
        }

        tokio::select! {
            event = events.recv() => match event {
                Some(HandshakeEvent::Ack(from)) if from == target => break Ok(from),
                Some(HandshakeEvent::Request(from)) if from == target => {
                    // Simultaneous join: the peer's Hello reached us first
                    match acknowledge(&socket, from).await {
                        Ok(()) => break Ok(from),
                        Err(e) => break Err(e),
                    }
                }
                Some(other) => debug!("Ignoring {:?} while punching towards {}", other, target),
                None => break Err(SessionError::NotConnected),
            },
            _ = tokio::time::sleep_until(deadline.min(next_hello)) => {
                if Instant::now() >= deadline {
                    break Err(SessionError::HandshakeTimeout { peer: target, timeout });
                }
            }
            _ = session.closed() => break Err(SessionError::NotConnected),
        }
    };

    finish(session, outcome)
}

/// Passive side: answer the first `Hello` and adopt its source as the peer
///
/// Waits until a request arrives or the session is torn down.
pub async fn listen(session: &Session) -> SessionResult<SocketAddr> {
    let socket = session.begin_punching()?;
    let mut events = session.install_handshake_route();

    match session.local_addr() {
        Some(addr) => info!("👂 Waiting for a peer on port {}...", addr.port()),
        None => info!("👂 Waiting for a peer..."),
    }

    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(HandshakeEvent::Request(from)) => {
                    info!("Hello from {}", from);
                    match acknowledge(&socket, from).await {
                        Ok(()) => break Ok(from),
                        Err(e) => break Err(e),
                    }
                }
                Some(HandshakeEvent::Ack(from)) => debug!("Unsolicited ack from {} ignored", from),
                None => break Err(SessionError::NotConnected),
            },
            _ = session.closed() => break Err(SessionError::NotConnected),
        }
    };

    finish(session, outcome)
}

async fn acknowledge(socket: &UdpSocket, to: SocketAddr) -> SessionResult<()> {
    socket.send_to(HANDSHAKE_ACK, to).await?;
    debug!("Sent Hello back! to {}", to);
    Ok(())
}

/// Apply the handshake outcome to the session state
fn finish(session: &Session, outcome: SessionResult<SocketAddr>) -> SessionResult<SocketAddr> {
    session.clear_handshake_route();

    match outcome.and_then(|peer| session.establish(peer).map(|()| peer)) {
        Ok(peer) => {
            info!("✅ Connected to {}", peer);
            Ok(peer)
        }
        Err(SessionError::NotConnected) => {
            debug!("Handshake abandoned: session closed");
            session.disconnect();
            Err(SessionError::NotConnected)
        }
        Err(e) => {
            warn!("❌ Handshake failed: {}", e);
            session.fail(&e.to_string());
            Err(e)
        }
    }
}
