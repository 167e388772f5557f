//! Session state and the socket endpoint it owns
//!
//! A [`Session`] is a cheap, cloneable handle to the one piece of shared
//! mutable state in the process. Every worker (negotiator, keep-alive, chat,
//! file transfer, status monitor) holds a clone and observes state changes
//! through a `watch` channel, so a transition made by one worker is visible to
//! all of them without polling each other's internals.
//!
//! Transition rules:
//! - only the negotiator moves the session to PUNCHING or CONNECTED
//! - any worker may move it to DISCONNECTED on a fatal error
//! - `disconnect()` is idempotent
//!
//! The socket is read by exactly one task, the reader spawned when the socket
//! is bound. It classifies each datagram and hands it to the consumer that
//! owns that traffic: handshake events to the negotiator, data to the armed
//! file-receive job if any, otherwise to the chat channel. Teardown aborts the
//! reader and drops the socket, so nothing stays blocked on a read.

use std::fmt;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::protocol::{DatagramKind, Envelope, HANDSHAKE_ACK, MAX_DATAGRAM_SIZE};

/// Kernel socket buffer size requested for send and receive (OS may cap lower)
const SOCKET_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Consecutive read failures before the reader gives up on the socket
const MAX_READ_ERRORS: u32 = 3;

/// Chat datagrams buffered before new ones are dropped
const CHAT_QUEUE_DEPTH: usize = 256;

/// File chunks buffered between the reader and the file writer
const FILE_QUEUE_DEPTH: usize = 1024;

/// Handshake events buffered for the negotiator
const HANDSHAKE_QUEUE_DEPTH: usize = 16;

/// Connection state observed by every worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Idle,
    Punching,
    Connected,
    Disconnected,
}

impl SessionState {
    /// PUNCHING or CONNECTED: a join attempt must be rejected
    pub fn is_active(self) -> bool {
        matches!(self, Self::Punching | Self::Connected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::Punching => "PUNCHING",
            Self::Connected => "CONNECTED",
            Self::Disconnected => "DISCONNECTED",
        };
        f.write_str(name)
    }
}

/// Handshake traffic forwarded to the negotiator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeEvent {
    Request(SocketAddr),
    Ack(SocketAddr),
}

#[derive(Default)]
struct Routes {
    handshake: Option<mpsc::Sender<HandshakeEvent>>,
    chat: Option<mpsc::Sender<Bytes>>,
    file: Option<mpsc::Sender<Bytes>>,
}

struct Inner {
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    peer: Mutex<Option<SocketAddr>>,
    last_activity: Mutex<Instant>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    routes: Mutex<Routes>,
}

/// Shared handle to the process-wide session
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Bind a UDP socket on all IPv4 interfaces
///
/// No SO_REUSEADDR: a second instance on the same port must fail with
/// AddrInUse instead of silently stealing datagrams.
pub fn bind_udp(local_port: u16) -> SessionResult<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        debug!("Could not enlarge receive buffer: {}", e);
    }
    if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        debug!("Could not enlarge send buffer: {}", e);
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], local_port));
    socket.bind(&SockAddr::from(addr))?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

impl Session {
    /// Create an IDLE session; nothing is bound until a join or listen
    pub fn new(config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            inner: Arc::new(Inner {
                config,
                state,
                peer: Mutex::new(None),
                last_activity: Mutex::new(Instant::now()),
                socket: Mutex::new(None),
                reader: Mutex::new(None),
                routes: Mutex::new(Routes::default()),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Receiver that sees every state transition
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Remote endpoint, fixed once the handshake completes
    pub fn peer(&self) -> Option<SocketAddr> {
        *lock(&self.inner.peer)
    }

    /// Address the socket is actually bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.socket)
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
    }

    /// Last time any datagram arrived from the peer
    pub fn last_activity(&self) -> Instant {
        *lock(&self.inner.last_activity)
    }

    /// How long the peer has been silent
    pub fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }

    fn touch(&self) {
        *lock(&self.inner.last_activity) = Instant::now();
    }

    pub(crate) fn socket(&self) -> SessionResult<Arc<UdpSocket>> {
        lock(&self.inner.socket).clone().ok_or(SessionError::NotConnected)
    }

    /// Send one datagram to the fixed peer; requires CONNECTED
    pub async fn send_to_peer(&self, payload: &[u8]) -> SessionResult<usize> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let peer = self.peer().ok_or(SessionError::NotConnected)?;
        let socket = self.socket()?;
        Ok(socket.send_to(payload, peer).await?)
    }

    /// Resolve once the session is no longer PUNCHING or CONNECTED
    pub async fn closed(&self) {
        let mut rx = self.subscribe();
        loop {
            let active = rx.borrow_and_update().is_active();
            if !active {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Claim the session for a handshake and bind its socket
    ///
    /// The claim is a single atomic check-and-set on the state value so two
    /// concurrent join attempts cannot both win.
    pub(crate) fn begin_punching(&self) -> SessionResult<Arc<UdpSocket>> {
        let mut current = SessionState::Idle;
        let claimed = self.inner.state.send_if_modified(|state| {
            current = *state;
            if state.is_active() {
                false
            } else {
                *state = SessionState::Punching;
                true
            }
        });
        if !claimed {
            return Err(SessionError::AlreadyActive(current));
        }

        *lock(&self.inner.peer) = None;
        *lock(&self.inner.routes) = Routes::default();

        let socket = match bind_udp(self.inner.config.local_port) {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                warn!("Failed to bind UDP port {}: {}", self.inner.config.local_port, e);
                self.inner.state.send_replace(SessionState::Disconnected);
                return Err(e);
            }
        };

        if let Ok(addr) = socket.local_addr() {
            info!("Socket bound on {}", addr);
        }

        *lock(&self.inner.socket) = Some(socket.clone());
        let reader = tokio::spawn(read_loop(self.clone(), socket.clone(), self.subscribe()));
        *lock(&self.inner.reader) = Some(reader);

        Ok(socket)
    }

    pub(crate) fn install_handshake_route(&self) -> mpsc::Receiver<HandshakeEvent> {
        let (tx, rx) = mpsc::channel(HANDSHAKE_QUEUE_DEPTH);
        lock(&self.inner.routes).handshake = Some(tx);
        rx
    }

    pub(crate) fn clear_handshake_route(&self) {
        lock(&self.inner.routes).handshake = None;
    }

    /// PUNCHING -> CONNECTED with the peer fixed for the rest of the session
    pub(crate) fn establish(&self, peer: SocketAddr) -> SessionResult<()> {
        *lock(&self.inner.peer) = Some(peer);
        let established = self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Punching {
                *state = SessionState::Connected;
                true
            } else {
                false
            }
        });
        if !established {
            *lock(&self.inner.peer) = None;
            return Err(SessionError::NotConnected);
        }
        self.touch();
        Ok(())
    }

    /// Route chat datagrams to a new receiver; requires CONNECTED
    pub(crate) fn arm_chat(&self) -> SessionResult<mpsc::Receiver<Bytes>> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let (tx, rx) = mpsc::channel(CHAT_QUEUE_DEPTH);
        lock(&self.inner.routes).chat = Some(tx);
        Ok(rx)
    }

    /// Route data datagrams to a file-receive job until disarmed
    pub(crate) fn arm_file(&self) -> SessionResult<mpsc::Receiver<Bytes>> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let (tx, rx) = mpsc::channel(FILE_QUEUE_DEPTH);
        lock(&self.inner.routes).file = Some(tx);
        Ok(rx)
    }

    pub(crate) fn disarm_file(&self) {
        lock(&self.inner.routes).file = None;
    }

    /// Explicit teardown; safe to call in any state, any number of times
    pub fn disconnect(&self) {
        self.teardown("disconnected");
    }

    /// Teardown after a fatal error in one of the workers
    pub(crate) fn fail(&self, reason: &str) {
        warn!("Session failed: {}", reason);
        self.teardown(reason);
    }

    fn teardown(&self, reason: &str) {
        let previous = self.inner.state.send_replace(SessionState::Disconnected);

        *lock(&self.inner.routes) = Routes::default();
        *lock(&self.inner.peer) = None;
        if let Some(reader) = lock(&self.inner.reader).take() {
            reader.abort();
        }
        let had_socket = lock(&self.inner.socket).take().is_some();

        if previous.is_active() || had_socket {
            info!("Session {} -> DISCONNECTED ({})", previous, reason);
        } else {
            debug!("Disconnect on {} session ignored", previous);
        }
    }

    /// Hand one received datagram to whoever owns that kind of traffic
    async fn dispatch(&self, socket: &UdpSocket, envelope: Envelope) {
        let state = self.state();
        let from_peer = self.peer() == Some(envelope.from);
        let kind = envelope.kind();

        if from_peer {
            self.touch();
        }

        match kind {
            DatagramKind::HandshakeRequest | DatagramKind::HandshakeAck => {
                if state == SessionState::Punching {
                    let event = match kind {
                        DatagramKind::HandshakeRequest => HandshakeEvent::Request(envelope.from),
                        _ => HandshakeEvent::Ack(envelope.from),
                    };
                    let route = lock(&self.inner.routes).handshake.clone();
                    if let Some(tx) = route {
                        if tx.try_send(event).is_err() {
                            debug!("Handshake queue full, dropped {:?}", event);
                        }
                    }
                } else if state == SessionState::Connected
                    && from_peer
                    && kind == DatagramKind::HandshakeRequest
                {
                    // Late or duplicate request: the peer may have missed our ack
                    if let Err(e) = socket.send_to(HANDSHAKE_ACK, envelope.from).await {
                        warn!("Failed to re-acknowledge {}: {}", envelope.from, e);
                    }
                } else {
                    debug!("Ignoring {:?} from {} while {}", kind, envelope.from, state);
                }
            }

            DatagramKind::KeepAlive => {
                debug!("PING from {}", envelope.from);
            }

            DatagramKind::Terminator | DatagramKind::Data => {
                if state != SessionState::Connected || !from_peer {
                    debug!(
                        "Dropping {} byte datagram from {} while {}",
                        envelope.payload.len(),
                        envelope.from,
                        state
                    );
                    return;
                }
                self.route_data(kind, envelope.payload).await;
            }
        }
    }

    async fn route_data(&self, kind: DatagramKind, payload: Bytes) {
        let (file, chat) = {
            let routes = lock(&self.inner.routes);
            (routes.file.clone(), routes.chat.clone())
        };

        if let Some(file) = file {
            // Backpressure: the reader waits for the file writer
            if file.send(payload).await.is_err() {
                debug!("File receiver gone, disarming");
                self.disarm_file();
            }
            return;
        }

        if kind == DatagramKind::Terminator {
            debug!("Stray end-of-transfer marker ignored");
            return;
        }

        match chat {
            Some(chat) => match chat.try_send(payload) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Chat queue full, message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    lock(&self.inner.routes).chat = None;
                }
            },
            None => debug!("No consumer for {} byte datagram", payload.len()),
        }
    }
}

/// The single reader of a bound socket
async fn read_loop(
    session: Session,
    socket: Arc<UdpSocket>,
    mut state_rx: watch::Receiver<SessionState>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut consecutive_errors = 0u32;

    loop {
        let received = tokio::select! {
            received = socket.recv_from(&mut buf) => received,
            changed = state_rx.changed() => {
                let active = state_rx.borrow().is_active();
                if changed.is_err() || !active {
                    break;
                }
                continue;
            }
        };

        match received {
            Ok((len, from)) => {
                consecutive_errors = 0;
                let envelope = Envelope::new(Bytes::copy_from_slice(&buf[..len]), from);
                session.dispatch(&socket, envelope).await;
            }
            // ICMP port unreachable surfaces here on some platforms
            Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                debug!("Ignoring connection reset on UDP socket");
            }
            Err(e) => {
                consecutive_errors += 1;
                warn!("UDP read error ({}/{}): {}", consecutive_errors, MAX_READ_ERRORS, e);
                if consecutive_errors >= MAX_READ_ERRORS {
                    session.fail(&format!("socket read failed: {}", e));
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    debug!("Reader stopped");
}


#[cfg(test)]
mod tests {
    use super::test_support::loopback;
    use super::*;

    async fn connected_session() -> (Session, UdpSocket) {
        test_support::connected_to_raw_peer(SessionConfig::ephemeral()).await
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SessionState::Idle.to_string(), "IDLE");
        assert_eq!(SessionState::Connected.to_string(), "CONNECTED");
        assert!(SessionState::Punching.is_active());
        assert!(!SessionState::Disconnected.is_active());
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let session = Session::new(SessionConfig::ephemeral());
        assert_eq!(session.state(), SessionState::Idle);
        session.disconnect();
        assert_eq!(session.state(), SessionState::Disconnected);
        session.disconnect();
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_second_claim_is_rejected() {
        let session = Session::new(SessionConfig::ephemeral());
        session.begin_punching().unwrap();
        match session.begin_punching() {
            Err(SessionError::AlreadyActive(SessionState::Punching)) => {}
            other => panic!("expected AlreadyActive, got {:?}", other.map(|_| ())),
        }
        session.disconnect();
    }

    #[tokio::test]
    async fn test_port_in_use_fails_bind() {
        let holder = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = holder.local_addr().unwrap().port();

        let config = SessionConfig { local_port: port, ..SessionConfig::ephemeral() };
        let session = Session::new(config);
        match session.begin_punching() {
            Err(SessionError::Io(e)) => assert_eq!(e.kind(), ErrorKind::AddrInUse),
            other => panic!("expected AddrInUse, got {:?}", other.map(|_| ())),
        }
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_establish_fixes_peer() {
        let (session, remote) = connected_session().await;
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.peer(), Some(remote.local_addr().unwrap()));

        session.send_to_peer(b"direct").await.unwrap();
        let mut buf = [0u8; 64];
        let (len, _) = remote.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"direct");
        session.disconnect();
    }

    #[tokio::test]
    async fn test_disconnect_releases_socket_and_consumers() {
        let (session, _remote) = connected_session().await;
        let mut chat = session.arm_chat().unwrap();

        session.disconnect();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.socket().is_err());
        assert!(session.peer().is_none());
        assert!(chat.recv().await.is_none());
        assert!(matches!(
            session.send_to_peer(b"late").await,
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_data_routed_to_chat_from_peer_only() {
        let (session, remote) = connected_session().await;
        let mut chat = session.arm_chat().unwrap();
        let target = loopback(&session);

        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        stranger.send_to(b"spoofed", target).await.unwrap();
        remote.send_to(b"genuine", target).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), chat.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got[..], b"genuine");
        session.disconnect();
    }

    #[tokio::test]
    async fn test_file_route_takes_precedence() {
        let (session, remote) = connected_session().await;
        let mut chat = session.arm_chat().unwrap();
        let mut file = session.arm_file().unwrap();
        let target = loopback(&session);

        remote.send_to(b"chunk", target).await.unwrap();
        remote.send_to(b"", target).await.unwrap();

        let wait = Duration::from_secs(2);
        let chunk = tokio::time::timeout(wait, file.recv()).await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"chunk");
        let end = tokio::time::timeout(wait, file.recv()).await.unwrap().unwrap();
        assert!(end.is_empty());

        session.disarm_file();
        remote.send_to(b"back to chat", target).await.unwrap();
        let text = tokio::time::timeout(wait, chat.recv()).await.unwrap().unwrap();
        assert_eq!(&text[..], b"back to chat");
        session.disconnect();
    }

    #[tokio::test]
    async fn test_duplicate_hello_reacknowledged() {
        let (session, remote) = connected_session().await;
        let target = loopback(&session);

        remote.send_to(b"Hello", target).await.unwrap();
        let mut buf = [0u8; 32];
        let (len, from) = tokio::time::timeout(Duration::from_secs(1), remote.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], HANDSHAKE_ACK);
        assert_eq!(from.port(), target.port());
        assert_eq!(session.state(), SessionState::Connected);

        // Only the fixed peer gets an answer
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        stranger.send_to(b"Hello", target).await.unwrap();
        let silence =
            tokio::time::timeout(Duration::from_millis(150), stranger.recv_from(&mut buf)).await;
        assert!(silence.is_err());
        assert_eq!(session.peer(), Some(remote.local_addr().unwrap()));

        session.disconnect();
    }

    #[tokio::test]
    async fn test_keepalive_updates_activity() {
        let (session, remote) = connected_session().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(session.idle_for() >= Duration::from_millis(300));
        remote.send_to(b"PING", loopback(&session)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.idle_for() < Duration::from_millis(250));
        session.disconnect();
    }
}
