//! Peer-to-peer chat and file sharing over UDP hole punching
//!
//! Both peers bind the same well-known local port. One side listens, the
//! other joins by address; the `Hello` / `Hello back!` exchange opens the NAT
//! mappings on both ends and the session stays up with periodic `PING`s.
//!
//! Usage:
//!   Listen:  udp-share -m listen
//!   Join:    udp-share -m join -p 203.0.113.7:5000
//!   Send:    udp-share -m send -p 203.0.113.7:5000 -f file.bin
//!   Receive: udp-share -m receive -o file.bin

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod chat;
mod config;
mod error;
mod hole_punch;
mod keepalive;
mod protocol;
mod session;
mod status;
mod transfer;

use chat::Direction;
use config::{SessionConfig, DEFAULT_PORT};
use error::SessionError;
use hole_punch::PeerAddress;
use protocol::UiEvent;
use session::Session;
use status::{run_status_monitor, StaticReachability, TcpReachability};

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Wait for a peer, then chat
    Listen,
    /// Punch through to a peer, then chat
    Join,
    /// Join, send one file, disconnect
    Send,
    /// Listen, receive one file, disconnect
    Receive,
}

#[derive(Parser, Debug)]
#[command(name = "udp-share")]
#[command(version)]
#[command(about = "Peer-to-peer chat and file transfer over UDP hole punching")]
struct Args {
    /// What to do
    #[arg(short, long, value_enum, default_value_t = Mode::Listen)]
    mode: Mode,

    /// Peer address (host:port), required for join and send
    #[arg(short, long)]
    peer: Option<String>,

    /// File to send (send mode)
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Where to save the received file (receive mode)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Local UDP port
    #[arg(long, env = "UDP_SHARE_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Handshake timeout in seconds
    #[arg(long, default_value = "5")]
    timeout: u64,

    /// Keep-alive interval in seconds
    #[arg(long, default_value = "5")]
    keepalive: u64,

    /// Disconnect when the peer is silent this many seconds (off by default)
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Give up a receive when no chunk arrives for this many seconds
    #[arg(long, default_value = "30")]
    transfer_timeout: u64,

    /// Skip the handshake in send/receive mode and stream straight from a fresh socket
    #[arg(long)]
    direct: bool,

    /// Print events as newline-delimited JSON
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Hide transfer progress bars
    #[arg(long)]
    no_progress: bool,

    /// Report OFFLINE/CONNECTED without probing the internet
    #[arg(long)]
    offline: bool,
}

impl Args {
    /// Reject bad combinations before any socket is bound
    fn validate(&self) -> Result<Option<PeerAddress>> {
        if self.timeout == 0 || self.keepalive == 0 || self.transfer_timeout == 0 {
            return Err(anyhow!("timeouts and intervals must be at least one second"));
        }
        if self.idle_timeout == Some(0) {
            return Err(anyhow!("--idle-timeout must be at least one second"));
        }

        let peer = match &self.peer {
            Some(input) => Some(input.parse::<PeerAddress>()?),
            None => None,
        };

        match self.mode {
            Mode::Join | Mode::Send if peer.is_none() => {
                return Err(anyhow!("--peer required for {:?} mode", self.mode));
            }
            Mode::Send => {
                let file = self.file.as_ref().ok_or_else(|| anyhow!("--file required for send mode"))?;
                if !file.is_file() {
                    return Err(anyhow!("File not found: {}", file.display()));
                }
            }
            Mode::Receive if self.output.is_none() => {
                return Err(anyhow!("--output required for receive mode"));
            }
            _ => {}
        }
        if self.direct && !matches!(self.mode, Mode::Send | Mode::Receive) {
            return Err(anyhow!("--direct only applies to send and receive modes"));
        }

        Ok(peer)
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            local_port: self.port,
            handshake_timeout: Duration::from_secs(self.timeout),
            keepalive_interval: Duration::from_secs(self.keepalive),
            idle_timeout: self.idle_timeout.map(Duration::from_secs),
            transfer_timeout: Duration::from_secs(self.transfer_timeout),
            ..SessionConfig::default()
        }
    }
}

/// Writes UI events to stdout; logs go to stderr
#[derive(Debug, Clone, Copy)]
struct Presenter {
    json: bool,
}

impl Presenter {
    fn emit(&self, event: &UiEvent) {
        if self.json {
            print!("{}", event.to_json_line());
        } else {
            println!("{}", event);
        }
    }

    fn report(&self, err: &SessionError) {
        self.emit(&session_error_event(err));
    }
}

/// Input errors are reported apart from network and I/O failures
fn session_error_event(err: &SessionError) -> UiEvent {
    let message = err.to_string();
    if err.is_validation() {
        UiEvent::InvalidInput { message }
    } else {
        UiEvent::Error { message }
    }
}

fn is_invalid_input(err: &anyhow::Error) -> bool {
    err.downcast_ref::<SessionError>()
        .is_some_and(SessionError::is_validation)
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Run the handshake as initiator (`peer` given) or listener
async fn connect(session: &Session, peer: Option<&str>, presenter: Presenter) -> Result<()> {
    let remote = match peer {
        Some(peer) => hole_punch::join(session, peer).await?,
        None => hole_punch::listen(session).await?,
    };

    let local_port = session.local_addr().map(|a| a.port()).unwrap_or(0);
    presenter.emit(&UiEvent::Connected {
        peer: remote.to_string(),
        local_port,
    });
    Ok(())
}

enum Command<'a> {
    Quit,
    Send(&'a str),
    Recv(&'a str),
    Say(&'a str),
}

fn parse_command(line: &str) -> Command<'_> {
    let trimmed = line.trim();
    let (word, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (trimmed, ""),
    };
    match word {
        "/quit" if rest.is_empty() => Command::Quit,
        "/send" => Command::Send(rest),
        "/recv" => Command::Recv(rest),
        _ => Command::Say(line),
    }
}

/// Interactive chat: stdin lines go to the peer, received messages to stdout
async fn run_console(session: &Session, peer: Option<&str>, presenter: Presenter, show_progress: bool) -> Result<()> {
    connect(session, peer, presenter).await?;

    let liveness = keepalive::spawn_liveness(session);
    let (chat_tx, chat_rx) = chat::open(session)?;
    let incoming = tokio::spawn(chat_rx.run(move |message| presenter.emit(&UiEvent::chat(&message))));

    info!("💬 Type to chat, /send <path>, /recv <path>, /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut reason = "peer session ended";

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("reading stdin")?,
            _ = session.closed() => break,
        };
        let Some(line) = line else {
            reason = "input closed";
            break;
        };

        let outcome = match parse_command(&line) {
            Command::Quit => {
                reason = "closed by user";
                break;
            }
            Command::Send(path) => transfer::send_file(session, path, show_progress)
                .await
                .map(|summary| presenter.emit(&UiEvent::transfer(Direction::Sent, path, &summary))),
            Command::Recv(path) => transfer::receive_file(session, path, show_progress)
                .await
                .map(|summary| presenter.emit(&UiEvent::transfer(Direction::Received, path, &summary))),
            Command::Say(text) if text.trim().is_empty() => Ok(()),
            Command::Say(text) => chat_tx
                .send(text)
                .await
                .map(|message| presenter.emit(&UiEvent::chat(&message))),
        };

        match outcome {
            Ok(()) => {}
            Err(SessionError::NotConnected) => break,
            Err(e) if e.is_validation() => presenter.report(&e),
            Err(e) => {
                warn!("{}", e);
                presenter.report(&e);
            }
        }
    }

    session.disconnect();
    for handle in liveness {
        let _ = handle.await;
    }
    let _ = incoming.await;
    debug!("Chat history: {} messages", chat_tx.log().len());
    presenter.emit(&UiEvent::Disconnected {
        reason: reason.to_string(),
    });
    Ok(())
}

async fn run_send(args: &Args, session: &Session, peer: &PeerAddress, presenter: Presenter) -> Result<()> {
    let file = args.file.as_ref().ok_or_else(|| anyhow!("--file required for send mode"))?;
    let show_progress = !args.no_progress;

    let summary = if args.direct {
        info!("📤 Streaming {} straight to {}", file.display(), peer);
        transfer::send_file_to(peer, file, args.port, show_progress).await?
    } else {
        connect(session, args.peer.as_deref(), presenter).await?;
        let _liveness = keepalive::spawn_liveness(session);
        transfer::send_file(session, file, show_progress).await?
    };

    presenter.emit(&UiEvent::transfer(Direction::Sent, &file.display().to_string(), &summary));
    Ok(())
}

async fn run_receive(args: &Args, session: &Session, presenter: Presenter) -> Result<()> {
    let output = args.output.as_ref().ok_or_else(|| anyhow!("--output required for receive mode"))?;
    let show_progress = !args.no_progress;

    let summary = if args.direct {
        info!("📥 Receiving straight into {} on port {}", output.display(), args.port);
        let stall = Duration::from_secs(args.transfer_timeout);
        transfer::receive_file_on(args.port, output, stall, show_progress).await?
    } else {
        connect(session, None, presenter).await?;
        let _liveness = keepalive::spawn_liveness(session);
        transfer::receive_file(session, output, show_progress).await?
    };

    presenter.emit(&UiEvent::transfer(Direction::Received, &output.display().to_string(), &summary));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.debug);

    info!("UDP Share v{}", APP_VERSION);
    info!("=================");

    let presenter = Presenter { json: args.json };
    let peer = match args.validate() {
        Ok(peer) => peer,
        Err(e) => {
            presenter.emit(&UiEvent::InvalidInput { message: e.to_string() });
            return Ok(ExitCode::from(2));
        }
    };
    let session = Session::new(args.session_config());

    // Presence updates
    let (status_tx, mut status_rx) = mpsc::channel(16);
    if args.offline {
        tokio::spawn(run_status_monitor(session.clone(), StaticReachability(false), status_tx));
    } else {
        tokio::spawn(run_status_monitor(session.clone(), TcpReachability::default(), status_tx));
    }
    tokio::spawn(async move {
        while let Some(status) = status_rx.recv().await {
            presenter.emit(&UiEvent::Status { status });
        }
    });

    // Handle Ctrl+C
    let signal_session = session.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Ctrl+C received, disconnecting...");
            signal_session.disconnect();
        }
    });

    let show_progress = !args.no_progress;
    let result = match args.mode {
        Mode::Listen => run_console(&session, None, presenter, show_progress).await,
        Mode::Join => run_console(&session, args.peer.as_deref(), presenter, show_progress).await,
        Mode::Send => match &peer {
            Some(peer) => run_send(&args, &session, peer, presenter).await,
            None => Err(anyhow!("--peer required for send mode")),
        },
        Mode::Receive => run_receive(&args, &session, presenter).await,
    };

    session.disconnect();
    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) if is_invalid_input(&e) => {
            presenter.emit(&UiEvent::InvalidInput { message: e.to_string() });
            Ok(ExitCode::from(2))
        }
        Err(e) => {
            presenter.emit(&UiEvent::Error { message: e.to_string() });
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["udp-share"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_listen_needs_nothing() {
        let parsed = args(&[]);
        assert_eq!(parsed.mode, Mode::Listen);
        assert!(parsed.validate().unwrap().is_none());
    }

    #[test]
    fn test_join_requires_valid_peer() {
        assert!(args(&["-m", "join"]).validate().is_err());
        assert!(args(&["-m", "join", "-p", "nocolon"]).validate().is_err());
        let peer = args(&["-m", "join", "-p", "10.0.0.2:5000"]).validate().unwrap().unwrap();
        assert_eq!(peer.host, "10.0.0.2");
        assert_eq!(peer.port, 5000);
    }

    #[test]
    fn test_send_requires_existing_file() {
        assert!(args(&["-m", "send", "-p", "10.0.0.2:5000"]).validate().is_err());
        assert!(args(&["-m", "send", "-p", "10.0.0.2:5000", "-f", "/no/such/file"]).validate().is_err());

        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        assert!(args(&["-m", "send", "-p", "10.0.0.2:5000", "-f", path]).validate().is_ok());
    }

    #[test]
    fn test_receive_requires_output() {
        assert!(args(&["-m", "receive"]).validate().is_err());
        assert!(args(&["-m", "receive", "-o", "out.bin"]).validate().is_ok());
        assert!(args(&["-m", "join", "-p", "h:1", "--direct"]).validate().is_err());
    }

    #[test]
    fn test_session_config_from_flags() {
        let config = args(&["--port", "6000", "--idle-timeout", "20", "--timeout", "3"]).session_config();
        assert_eq!(config.local_port, 6000);
        assert_eq!(config.handshake_timeout, Duration::from_secs(3));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(20)));
    }

    #[test]
    fn test_parse_command() {
        assert!(matches!(parse_command("/quit"), Command::Quit));
        assert!(matches!(parse_command("/send a.bin"), Command::Send("a.bin")));
        assert!(matches!(parse_command("/recv  b.bin "), Command::Recv("b.bin")));
        assert!(matches!(parse_command(" hi there"), Command::Say(" hi there")));
        assert!(matches!(parse_command("/send"), Command::Send("")));
    }

    #[test]
    fn test_commands_need_a_word_boundary() {
        assert!(matches!(parse_command("/sending soon"), Command::Say("/sending soon")));
        assert!(matches!(parse_command("/recvd it"), Command::Say("/recvd it")));
        assert!(matches!(parse_command("/quitting now"), Command::Say("/quitting now")));
        assert!(matches!(parse_command("/quit now"), Command::Say("/quit now")));
        assert!(matches!(parse_command("/send\tnotes.txt"), Command::Send("notes.txt")));
    }

    #[test]
    fn test_validation_errors_reported_apart() {
        let event = session_error_event(&SessionError::EmptyInput("message"));
        assert!(matches!(event, UiEvent::InvalidInput { .. }));
        let event = session_error_event(&SessionError::NotConnected);
        assert!(matches!(event, UiEvent::Error { .. }));

        let invalid = anyhow::Error::from("nocolon".parse::<PeerAddress>().unwrap_err());
        assert!(is_invalid_input(&invalid));
        assert!(!is_invalid_input(&anyhow!("socket closed")));
        assert!(!is_invalid_input(&anyhow::Error::from(SessionError::NotConnected)));
    }
}
