//! Keep-alive driver
//!
//! Sends `PING` to the peer on a fixed period while the session is CONNECTED
//! so the NAT mappings on both sides do not expire. It never reads the socket
//! and never decides the peer is gone; that is the job of the optional idle
//! watchdog, which only runs when an idle timeout is configured.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::error::{SessionError, SessionResult};
use crate::protocol::KEEPALIVE_PROBE;
use crate::session::Session;

/// Floor for the watchdog polling period
const MIN_WATCHDOG_TICK: Duration = Duration::from_millis(10);

/// Send a probe every `keepalive_interval` until the session leaves CONNECTED
///
/// Returns the number of probes sent. A send failure is fatal for the
/// session.
pub async fn run_keep_alive(session: Session) -> SessionResult<u64> {
    let period = session.config().keepalive_interval;
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut sent = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = session.closed() => break,
        }

        // State is re-checked before every resend
        if !session.is_connected() {
            break;
        }

        match session.send_to_peer(KEEPALIVE_PROBE).await {
            Ok(_) => {
                sent += 1;
                debug!("PING #{} sent", sent);
            }
            Err(SessionError::NotConnected) => break,
            Err(e) => {
                session.fail(&format!("keep-alive send failed: {}", e));
                return Err(e);
            }
        }
    }

    debug!("Keep-alive stopped after {} probes", sent);
    Ok(sent)
}

/// Disconnect once nothing has arrived from the peer for `idle_timeout`
pub async fn run_idle_watchdog(session: Session, idle_timeout: Duration) {
    let tick = (idle_timeout / 4).max(MIN_WATCHDOG_TICK);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(tick) => {}
            _ = session.closed() => return,
        }

        if !session.is_connected() {
            return;
        }

        let idle = session.idle_for();
        if idle >= idle_timeout {
            session.fail(&format!("peer silent for {:.1}s", idle.as_secs_f64()));
            return;
        }
    }
}

/// Start the keep-alive, plus the idle watchdog when one is configured
pub fn spawn_liveness(session: &Session) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(2);

    let keepalive_session = session.clone();
    handles.push(tokio::spawn(async move {
        let _ = run_keep_alive(keepalive_session).await;
    }));

    if let Some(idle_timeout) = session.config().idle_timeout {
        info!("Peer silence watchdog armed ({:?})", idle_timeout);
        handles.push(tokio::spawn(run_idle_watchdog(session.clone(), idle_timeout)));
    }

    handles
}
