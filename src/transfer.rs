//! Chunked UDP File Transfer
//!
//! Wire format: the file is read sequentially and sent as datagrams of
//! exactly CHUNK_SIZE bytes (the last one may be shorter), followed by one
//! zero-length datagram that marks the end of the transfer.
//!
//! There is no acknowledgment, retransmission or reordering buffer. Chunks
//! are appended in arrival order, so a lost or reordered datagram silently
//! corrupts the output. Both sides report a SHA-256 of what they streamed so
//! users can compare digests out of band.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{SessionError, SessionResult};
use crate::hole_punch::PeerAddress;
use crate::protocol::{DatagramKind, MAX_DATAGRAM_SIZE};
use crate::session::{bind_udp, Session};

/// Payload bytes per datagram
pub const CHUNK_SIZE: usize = 1024;

/// Yield to the runtime after this many chunks so the reader task keeps up
const CHUNKS_PER_YIELD: u64 = 32;

/// Progress update interval in bytes (64KB)
const PROGRESS_BYTE_INTERVAL: u64 = 64 * 1024;

/// Progress update interval in time
const PROGRESS_TIME_INTERVAL: Duration = Duration::from_millis(500);

/// Outcome of one transfer job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    /// Payload bytes streamed (terminator excluded)
    pub bytes: u64,
    /// Data chunks streamed (terminator excluded)
    pub chunks: u64,
    pub sha256: [u8; 32],
}

impl TransferSummary {
    pub fn sha256_hex(&self) -> String {
        sha256_to_hex(&self.sha256)
    }
}

/// Format hash as hex string
pub fn sha256_to_hex(hash: &[u8; 32]) -> String {
    hash.iter().map(|b| format!("{:02x}", b)).collect()
}

fn digest(hasher: Sha256) -> [u8; 32] {
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&hasher.finalize());
    hash
}

/// Progress tracker with hybrid (bytes OR time) updates
struct ProgressTracker {
    bar: ProgressBar,
    last_update_bytes: u64,
    last_update_time: Instant,
}

impl ProgressTracker {
    fn sending(total_bytes: u64, label: &str, visible: bool) -> Self {
        let bar = if visible {
            ProgressBar::new(total_bytes)
        } else {
            ProgressBar::hidden()
        };
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}")
            .map(|style| style.progress_chars("=>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.set_message(label.to_string());
        Self::with_bar(bar)
    }

    fn receiving(label: &str, visible: bool) -> Self {
        let bar = if visible {
            ProgressBar::new_spinner()
        } else {
            ProgressBar::hidden()
        };
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {bytes} ({bytes_per_sec}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        bar.set_style(style);
        bar.set_message(label.to_string());
        Self::with_bar(bar)
    }

    fn with_bar(bar: ProgressBar) -> Self {
        Self {
            bar,
            last_update_bytes: 0,
            last_update_time: Instant::now(),
        }
    }

    fn update(&mut self, current_bytes: u64) {
        let bytes_since_update = current_bytes - self.last_update_bytes;
        if bytes_since_update >= PROGRESS_BYTE_INTERVAL
            || self.last_update_time.elapsed() >= PROGRESS_TIME_INTERVAL
        {
            self.bar.set_position(current_bytes);
            self.last_update_bytes = current_bytes;
            self.last_update_time = Instant::now();
        }
    }

    fn finish(&self, current_bytes: u64, msg: String) {
        self.bar.set_position(current_bytes);
        self.bar.finish_with_message(msg);
    }

    fn abandon(&self) {
        self.bar.abandon();
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string()
}

fn require_path(path: &Path) -> SessionResult<()> {
    if path.as_os_str().is_empty() || path.to_string_lossy().trim().is_empty() {
        return Err(SessionError::EmptyInput("file path"));
    }
    Ok(())
}

/// Fill `buf` from `file`, stopping early only at EOF
async fn read_chunk(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

enum StreamError {
    Read(io::Error),
    Send(io::Error),
    Cancelled,
}

/// Send side of a transfer job
#[derive(Debug)]
pub struct FileSender {
    path: PathBuf,
    show_progress: bool,
}

impl FileSender {
    pub fn new(path: impl AsRef<Path>) -> SessionResult<Self> {
        let path = path.as_ref();
        require_path(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            show_progress: true,
        })
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Stream the file to the session's peer
    ///
    /// Stops as soon as the session leaves CONNECTED. A send failure tears the
    /// session down; a read failure only fails this job.
    pub async fn send(&self, session: &Session) -> SessionResult<TransferSummary> {
        if !session.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let peer = session.peer().ok_or(SessionError::NotConnected)?;
        let socket = session.socket()?;

        let file = File::open(&self.path).await?;
        match self.stream(file, &socket, peer, Some(session)).await {
            Ok(summary) => Ok(summary),
            Err(StreamError::Read(e)) => Err(SessionError::Io(e)),
            Err(StreamError::Send(e)) => {
                session.fail(&format!("file send failed: {}", e));
                Err(SessionError::Io(e))
            }
            Err(StreamError::Cancelled) => Err(SessionError::NotConnected),
        }
    }

    /// Stream the file from a fresh socket on `local_port`, without a session
    pub async fn send_to(&self, peer: &PeerAddress, local_port: u16) -> SessionResult<TransferSummary> {
        let target = peer.resolve().await?;
        let file = File::open(&self.path).await?;
        let socket = bind_udp(local_port)?;

        match self.stream(file, &socket, target, None).await {
            Ok(summary) => Ok(summary),
            Err(StreamError::Read(e)) | Err(StreamError::Send(e)) => Err(SessionError::Io(e)),
            Err(StreamError::Cancelled) => Err(SessionError::NotConnected),
        }
    }

    async fn stream(
        &self,
        mut file: File,
        socket: &UdpSocket,
        peer: SocketAddr,
        session: Option<&Session>,
    ) -> Result<TransferSummary, StreamError> {
        let start = Instant::now();
        let name = display_name(&self.path);
        let total = file.metadata().await.map(|m| m.len()).unwrap_or(0);

        info!("Sending {} ({} bytes) to {} in {} byte chunks", name, total, peer, CHUNK_SIZE);
        let mut progress = ProgressTracker::sending(total, &name, self.show_progress);

        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut bytes = 0u64;
        let mut chunks = 0u64;

        let outcome = loop {
            if session.is_some_and(|s| !s.is_connected()) {
                break Err(StreamError::Cancelled);
            }

            let n = match read_chunk(&mut file, &mut buffer).await {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(StreamError::Read(e)),
            };

            if let Err(e) = socket.send_to(&buffer[..n], peer).await {
                break Err(StreamError::Send(e));
            }

            hasher.update(&buffer[..n]);
            bytes += n as u64;
            chunks += 1;
            progress.update(bytes);

            if chunks % CHUNKS_PER_YIELD == 0 {
                tokio::task::yield_now().await;
            }
        };

        if let Err(e) = outcome {
            progress.abandon();
            warn!("Transfer of {} aborted after {} chunks", name, chunks);
            return Err(e);
        }

        // End-of-transfer marker
        socket.send_to(&[], peer).await.map_err(StreamError::Send)?;

        let summary = TransferSummary {
            bytes,
            chunks,
            sha256: digest(hasher),
        };
        let elapsed = start.elapsed();
        progress.finish(bytes, "✅ sent".to_string());
        info!(
            "Sent {} bytes in {} chunks ({:.1}s), SHA256 {}",
            bytes,
            chunks,
            elapsed.as_secs_f64(),
            summary.sha256_hex()
        );
        Ok(summary)
    }
}

/// Appends chunks to the output file in arrival order
struct ChunkWriter {
    file: BufWriter<File>,
    hasher: Sha256,
    bytes: u64,
    chunks: u64,
    progress: ProgressTracker,
}

impl ChunkWriter {
    async fn create(path: &Path, show_progress: bool) -> SessionResult<Self> {
        let file = File::create(path).await?;
        Ok(Self {
            file: BufWriter::new(file),
            hasher: Sha256::new(),
            bytes: 0,
            chunks: 0,
            progress: ProgressTracker::receiving(&display_name(path), show_progress),
        })
    }

    async fn append(&mut self, chunk: &[u8]) -> SessionResult<()> {
        self.file.write_all(chunk).await?;
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
        self.chunks += 1;
        self.progress.update(self.bytes);
        Ok(())
    }

    async fn finish(mut self) -> SessionResult<TransferSummary> {
        self.file.flush().await?;
        self.progress.finish(self.bytes, "✅ received".to_string());
        Ok(TransferSummary {
            bytes: self.bytes,
            chunks: self.chunks,
            sha256: digest(self.hasher),
        })
    }

    async fn abandon(mut self) {
        if let Err(e) = self.file.flush().await {
            debug!("Flush of partial file failed: {}", e);
        }
        self.progress.abandon();
    }
}

/// Where a receive job gets its datagrams from
///
/// `None` means the source is gone and no terminator will come.
trait ChunkSource {
    async fn next_chunk(&mut self) -> Option<Bytes>;
}

/// Payloads routed by the session's reader task
impl ChunkSource for mpsc::Receiver<Bytes> {
    async fn next_chunk(&mut self) -> Option<Bytes> {
        self.recv().await
    }
}

/// A socket of our own, locked onto the first sender
struct SocketSource {
    socket: UdpSocket,
    sender: Option<SocketAddr>,
    buf: Vec<u8>,
}

impl ChunkSource for SocketSource {
    async fn next_chunk(&mut self) -> Option<Bytes> {
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("UDP read error: {}", e);
                    return None;
                }
            };
            let payload = &self.buf[..len];
            if DatagramKind::classify(payload).is_control() {
                continue;
            }
            match self.sender {
                None => {
                    info!("Receiving from {}", from);
                    self.sender = Some(from);
                }
                Some(expected) if expected != from => {
                    debug!("Ignoring datagram from {}", from);
                    continue;
                }
                Some(_) => {}
            }
            return Some(Bytes::copy_from_slice(payload));
        }
    }
}

/// Receive side of a transfer job
#[derive(Debug)]
pub struct FileReceiver {
    save_path: PathBuf,
    show_progress: bool,
}

impl FileReceiver {
    pub fn new(save_path: impl AsRef<Path>) -> SessionResult<Self> {
        let save_path = save_path.as_ref();
        require_path(save_path)?;
        Ok(Self {
            save_path: save_path.to_path_buf(),
            show_progress: true,
        })
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Take over the session's data traffic until the terminator arrives
    ///
    /// Chat is suspended while the job is armed since chat text and chunks
    /// look the same on the wire. The stall timeout starts with the first
    /// chunk.
    pub async fn receive(&self, session: &Session) -> SessionResult<TransferSummary> {
        let mut incoming = session.arm_file()?;
        let stall = session.config().transfer_timeout;

        let writer = match ChunkWriter::create(&self.save_path, self.show_progress).await {
            Ok(writer) => writer,
            Err(e) => {
                session.disarm_file();
                return Err(e);
            }
        };

        info!("Ready to receive into {}", self.save_path.display());
        let result = self.drain(writer, stall, &mut incoming).await;
        session.disarm_file();
        result
    }

    /// Bind `local_port` and receive without a session
    pub async fn receive_on(&self, local_port: u16, stall: Duration) -> SessionResult<TransferSummary> {
        let socket = bind_udp(local_port)?;
        self.receive_on_socket(socket, stall).await
    }

    /// Receive from the first sender that shows up on `socket`
    ///
    /// Control tokens are skipped and datagrams from other sources dropped.
    pub async fn receive_on_socket(&self, socket: UdpSocket, stall: Duration) -> SessionResult<TransferSummary> {
        let writer = ChunkWriter::create(&self.save_path, self.show_progress).await?;
        if let Ok(addr) = socket.local_addr() {
            info!("Listening for a file on {}", addr);
        }

        let mut source = SocketSource {
            socket,
            sender: None,
            buf: vec![0u8; MAX_DATAGRAM_SIZE],
        };
        self.drain(writer, stall, &mut source).await
    }

    /// Write datagrams from `source` until the empty terminator
    async fn drain<S: ChunkSource>(
        &self,
        mut writer: ChunkWriter,
        stall: Duration,
        source: &mut S,
    ) -> SessionResult<TransferSummary> {
        let start = Instant::now();

        loop {
            let payload = if writer.chunks == 0 {
                source.next_chunk().await
            } else {
                match tokio::time::timeout(stall, source.next_chunk()).await {
                    Ok(payload) => payload,
                    Err(_) => {
                        warn!("No datagram for {:?}, giving up after {} bytes", stall, writer.bytes);
                        writer.abandon().await;
                        return Err(SessionError::TransferStalled(stall));
                    }
                }
            };

            match payload {
                Some(chunk) if chunk.is_empty() => break,
                Some(chunk) => {
                    if let Err(e) = writer.append(&chunk).await {
                        writer.abandon().await;
                        return Err(e);
                    }
                }
                None => {
                    warn!("Source closed mid-transfer after {} bytes", writer.bytes);
                    writer.abandon().await;
                    return Err(SessionError::NotConnected);
                }
            }
        }

        let summary = writer.finish().await?;
        info!(
            "Received {} bytes in {} chunks ({:.1}s) into {}, SHA256 {}",
            summary.bytes,
            summary.chunks,
            start.elapsed().as_secs_f64(),
            self.save_path.display(),
            summary.sha256_hex()
        );
        Ok(summary)
    }
}

/// Send `path` to the session's peer
pub async fn send_file(session: &Session, path: impl AsRef<Path>, show_progress: bool) -> SessionResult<TransferSummary> {
    FileSender::new(path)?.with_progress(show_progress).send(session).await
}

/// Receive the next file from the session's peer into `save_path`
pub async fn receive_file(
    session: &Session,
    save_path: impl AsRef<Path>,
    show_progress: bool,
) -> SessionResult<TransferSummary> {
    FileReceiver::new(save_path)?.with_progress(show_progress).receive(session).await
}

/// Send `path` to `peer` from a fresh socket on `local_port`
pub async fn send_file_to(
    peer: &PeerAddress,
    path: impl AsRef<Path>,
    local_port: u16,
    show_progress: bool,
) -> SessionResult<TransferSummary> {
    FileSender::new(path)?.with_progress(show_progress).send_to(peer, local_port).await
}

/// Bind `local_port` and receive one file into `save_path`
pub async fn receive_file_on(
    local_port: u16,
    save_path: impl AsRef<Path>,
    stall: Duration,
    show_progress: bool,
) -> SessionResult<TransferSummary> {
    FileReceiver::new(save_path)?
        .with_progress(show_progress)
        .receive_on(local_port, stall)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::session::test_support::{connected_pair, connected_to_raw_peer, loopback};
    use crate::session::SessionState;

    const WAIT: Duration = Duration::from_secs(5);

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    async fn collect_datagrams(peer: &UdpSocket) -> Vec<Vec<u8>> {
        let mut datagrams = Vec::new();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, _) = tokio::time::timeout(WAIT, peer.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            datagrams.push(buf[..len].to_vec());
            if len == 0 {
                return datagrams;
            }
        }
    }

    #[tokio::test]
    async fn test_3000_bytes_make_three_chunks_and_terminator() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.bin");
        let data = pattern(3000);
        std::fs::write(&path, &data).unwrap();

        let (session, peer) = connected_to_raw_peer(SessionConfig::ephemeral()).await;
        let sender = FileSender::new(&path).unwrap().with_progress(false);
        let (summary, datagrams) = tokio::join!(sender.send(&session), collect_datagrams(&peer));
        let summary = summary.unwrap();

        let sizes: Vec<usize> = datagrams.iter().map(Vec::len).collect();
        assert_eq!(sizes, [1024, 1024, 952, 0]);
        assert_eq!(datagrams.concat(), data);
        assert_eq!(summary.bytes, 3000);
        assert_eq!(summary.chunks, 3);
        session.disconnect();
    }

    #[tokio::test]
    async fn test_exact_multiple_and_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let (session, peer) = connected_to_raw_peer(SessionConfig::ephemeral()).await;

        let even = dir.path().join("even.bin");
        std::fs::write(&even, pattern(2048)).unwrap();
        let sender = FileSender::new(&even).unwrap().with_progress(false);
        let (_, datagrams) = tokio::join!(sender.send(&session), collect_datagrams(&peer));
        let sizes: Vec<usize> = datagrams.iter().map(Vec::len).collect();
        assert_eq!(sizes, [1024, 1024, 0]);

        let empty = dir.path().join("empty.bin");
        std::fs::write(&empty, b"").unwrap();
        let sender = FileSender::new(&empty).unwrap().with_progress(false);
        let (summary, datagrams) = tokio::join!(sender.send(&session), collect_datagrams(&peer));
        assert_eq!(summary.unwrap().chunks, 0);
        assert_eq!(datagrams, vec![Vec::<u8>::new()]);
        session.disconnect();
    }

    #[tokio::test]
    async fn test_end_to_end_bit_identical() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        let output = dir.path().join("output.bin");
        let data = pattern(3000);
        std::fs::write(&source, &data).unwrap();

        let (alice, bob) = connected_pair().await;
        let b = bob.clone();
        let out = output.clone();
        let receive = tokio::spawn(async move { receive_file(&b, &out, false).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = send_file(&alice, &source, false).await.unwrap();
        let received = tokio::time::timeout(WAIT, receive).await.unwrap().unwrap().unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), data);
        assert_eq!(sent, received);
        assert_eq!(received.chunks, 3);

        alice.disconnect();
        bob.disconnect();
    }

    #[tokio::test]
    async fn test_blank_paths_rejected() {
        assert!(FileSender::new("").unwrap_err().is_validation());
        assert!(FileReceiver::new("  ").unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_missing_file_keeps_session() {
        let (session, _peer) = connected_to_raw_peer(SessionConfig::ephemeral()).await;
        let err = FileSender::new("/definitely/not/here.bin")
            .unwrap()
            .with_progress(false)
            .send(&session)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Io(ref e) if e.kind() == io::ErrorKind::NotFound));
        assert_eq!(session.state(), SessionState::Connected);
        session.disconnect();
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"abc").unwrap();
        let session = Session::new(SessionConfig::ephemeral());
        let err = FileSender::new(&path).unwrap().send(&session).await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
    }

    #[tokio::test]
    async fn test_receive_stalls_without_terminator() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("partial.bin");
        let config = SessionConfig {
            transfer_timeout: Duration::from_millis(200),
            ..SessionConfig::ephemeral()
        };
        let (session, peer) = connected_to_raw_peer(config).await;
        let target = loopback(&session);

        let receiver = FileReceiver::new(&output).unwrap().with_progress(false);
        let s = session.clone();
        let receive = tokio::spawn(async move { receiver.receive(&s).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        peer.send_to(&pattern(1024), target).await.unwrap();
        let err = tokio::time::timeout(WAIT, receive).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err, SessionError::TransferStalled(_)));
        assert_eq!(std::fs::read(&output).unwrap().len(), 1024);
        assert_eq!(session.state(), SessionState::Connected);
        session.disconnect();
    }

    #[tokio::test]
    async fn test_receive_ends_on_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _peer) = connected_to_raw_peer(SessionConfig::ephemeral()).await;
        let receiver = FileReceiver::new(dir.path().join("never.bin")).unwrap().with_progress(false);
        let s = session.clone();
        let receive = tokio::spawn(async move { receiver.receive(&s).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        session.disconnect();
        let err = tokio::time::timeout(WAIT, receive).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
    }

    #[tokio::test]
    async fn test_standalone_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        let output = dir.path().join("output.bin");
        let data = pattern(5000);
        std::fs::write(&source, &data).unwrap();

        let socket = bind_udp(0).unwrap();
        let port = socket.local_addr().unwrap().port();
        let receiver = FileReceiver::new(&output).unwrap().with_progress(false);
        let receive = tokio::spawn(async move {
            receiver.receive_on_socket(socket, Duration::from_secs(2)).await
        });

        let peer: PeerAddress = format!("127.0.0.1:{}", port).parse().unwrap();
        let sent = send_file_to(&peer, &source, 0, false).await.unwrap();
        let received = tokio::time::timeout(WAIT, receive).await.unwrap().unwrap().unwrap();

        assert_eq!(sent.chunks, 5);
        assert_eq!(received, sent);
        assert_eq!(std::fs::read(&output).unwrap(), data);
    }

    #[tokio::test]
    async fn test_standalone_receiver_skips_control_and_strangers() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("output.bin");

        let socket = bind_udp(0).unwrap();
        let target = SocketAddr::from(([127, 0, 0, 1], socket.local_addr().unwrap().port()));
        let receiver = FileReceiver::new(&output).unwrap().with_progress(false);
        let receive = tokio::spawn(async move {
            receiver.receive_on_socket(socket, Duration::from_secs(2)).await
        });

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"PING", target).await.unwrap();
        sender.send_to(b"abc", target).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        stranger.send_to(b"zzz", target).await.unwrap();
        stranger.send_to(b"", target).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        sender.send_to(b"def", target).await.unwrap();
        sender.send_to(b"", target).await.unwrap();

        let received = tokio::time::timeout(WAIT, receive).await.unwrap().unwrap().unwrap();
        assert_eq!(received.chunks, 2);
        assert_eq!(std::fs::read(&output).unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn test_receive_file_on_port_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let taken = bind_udp(0).unwrap();
        let port = taken.local_addr().unwrap().port();
        let err = receive_file_on(port, dir.path().join("x.bin"), Duration::from_secs(1), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Io(ref e) if e.kind() == io::ErrorKind::AddrInUse));
    }

    #[test]
    fn test_sha256_hex() {
        let summary = TransferSummary {
            bytes: 0,
            chunks: 0,
            sha256: digest(Sha256::new()),
        };
        assert_eq!(
            summary.sha256_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
