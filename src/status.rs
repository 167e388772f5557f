//! Presence status
//!
//! Combines general internet reachability with the session state into the
//! single value shown to the user, and pushes it whenever it changes.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::session::{Session, SessionState};

/// Well-known endpoint probed for internet reachability (public DNS)
pub const REACHABILITY_PROBE: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::new(8, 8, 8, 8)), 53);

/// Connect timeout for the reachability probe
pub const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Presence {
    Offline,
    Online,
    Connected,
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Presence::Offline => "OFFLINE",
            Presence::Online => "ONLINE",
            Presence::Connected => "CONNECTED",
        };
        f.write_str(name)
    }
}

/// An active session wins over reachability: a LAN peer counts as CONNECTED
/// even without a route to the internet.
pub fn evaluate(internet_reachable: bool, state: SessionState) -> Presence {
    match (state, internet_reachable) {
        (SessionState::Connected, _) => Presence::Connected,
        (_, true) => Presence::Online,
        (_, false) => Presence::Offline,
    }
}

/// Source of the "is the internet reachable" answer
pub trait Reachability: Send + Sync {
    fn check(&self) -> impl Future<Output = bool> + Send;
}

/// TCP connect to a well-known endpoint
#[derive(Debug, Clone)]
pub struct TcpReachability {
    pub target: SocketAddr,
    pub timeout: Duration,
}

impl Default for TcpReachability {
    fn default() -> Self {
        Self {
            target: REACHABILITY_PROBE,
            timeout: REACHABILITY_TIMEOUT,
        }
    }
}

impl Reachability for TcpReachability {
    async fn check(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(self.target)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Reachability probe to {} failed: {}", self.target, e);
                false
            }
            Err(_) => {
                debug!("Reachability probe to {} timed out", self.target);
                false
            }
        }
    }
}

/// Fixed answer, for `--offline` and tests
#[derive(Debug, Clone, Copy)]
pub struct StaticReachability(pub bool);

impl Reachability for StaticReachability {
    async fn check(&self) -> bool {
        self.0
    }
}

/// Re-evaluate presence every `status_interval` and push changes to `updates`
///
/// The first evaluation is always pushed. A session state change triggers an
/// immediate re-evaluation. Returns when the receiving side of `updates` is
/// dropped.
pub async fn run_status_monitor<R: Reachability>(
    session: Session,
    reachability: R,
    updates: mpsc::Sender<Presence>,
) {
    let mut ticker = tokio::time::interval(session.config().status_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut state_rx = session.subscribe();
    let mut last: Option<Presence> = None;

    loop {
        let presence = evaluate(reachability.check().await, session.state());
        if last != Some(presence) {
            debug!("Presence now {}", presence);
            if updates.send(presence).await.is_err() {
                break;
            }
            last = Some(presence);
        }

        tokio::select! {
            _ = ticker.tick() => {}
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = updates.closed() => break,
        }
    }

    debug!("Status monitor stopped");
}
