//! Slave-side transport.
//!
//! A single-connection dialer: Disconnected → Connecting → Connected →
//! (Reconnecting | Disconnected). Lost connections reconnect with
//! exponential backoff while the operator still wants connectivity;
//! explicit disconnect cancels the reader, sender, and any pending
//! reconnect together.

pub(crate) mod applier;
pub(crate) mod drift;
pub mod state;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::engine::ShellEvent;
use crate::error::{Result, SyncError};
use crate::metrics::MetricsRecorder;
use crate::obs::ObsClient;
use crate::protocol::{MessageBody, SyncMessage};
use applier::Applier;
use state::ExpectedState;

/// Reconnect attempts before giving up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Settling delay before the post-connect snapshot request.
const HANDSHAKE_DELAY: Duration = Duration::from_millis(500);

/// Backoff before reconnect attempt `n + 1` (zero-based `n` failed
/// attempts so far): `min(2^n, 30)` seconds.
pub(crate) fn backoff_delay(failed_attempts: u32) -> Duration {
    Duration::from_secs((1u64 << failed_attempts.min(6)).min(30))
}

/// Connection state of the upstream link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Reconnection progress surfaced to the shell.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectionStatus {
    pub is_reconnecting: bool,
    pub attempt_count: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub next_delay_secs: u64,
}

/// Handle to the slave's upstream link. Cheap to clone.
#[derive(Clone)]
pub struct SlaveLink {
    inner: Arc<SlaveInner>,
}

struct SlaveInner {
    obs: ObsClient,
    expected: Arc<RwLock<ExpectedState>>,
    applier: Applier,
    events: broadcast::Sender<ShellEvent>,
    metrics: Arc<MetricsRecorder>,
    state: RwLock<LinkState>,
    reconnection: RwLock<Option<ReconnectionStatus>>,
    outbound: RwLock<Option<mpsc::UnboundedSender<SyncMessage>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    want_connected: AtomicBool,
}

impl SlaveLink {
    pub fn new(
        obs: ObsClient,
        events: broadcast::Sender<ShellEvent>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        let expected = Arc::new(RwLock::new(ExpectedState::new()));
        let applier = Applier::new(obs.clone(), Arc::clone(&expected), events.clone());
        Self {
            inner: Arc::new(SlaveInner {
                obs,
                expected,
                applier,
                events,
                metrics,
                state: RwLock::new(LinkState::Disconnected),
                reconnection: RwLock::new(None),
                outbound: RwLock::new(None),
                shutdown: Mutex::new(None),
                want_connected: AtomicBool::new(false),
            }),
        }
    }

    /// Start dialing the master. Returns immediately; progress is visible
    /// through `state()` and `reconnection_status()`.
    pub async fn connect(&self, host: &str, port: u16) -> Result<()> {
        // Restarting the supervisor implies tearing down any previous one.
        self.disconnect();

        self.inner.want_connected.store(true, Ordering::Release);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.inner.shutdown.lock() = Some(shutdown_tx);
        self.inner.set_state(LinkState::Connecting);

        tokio::spawn(supervisor(
            Arc::clone(&self.inner),
            host.to_string(),
            port,
            shutdown_rx,
        ));
        Ok(())
    }

    /// Drop the link and cancel any pending reconnect. Idempotent.
    pub fn disconnect(&self) {
        self.inner.want_connected.store(false, Ordering::Release);
        if let Some(shutdown) = self.inner.shutdown.lock().take() {
            let _ = shutdown.send(true);
        }
        *self.inner.outbound.write() = None;
        *self.inner.reconnection.write() = None;
        self.inner.set_state(LinkState::Disconnected);
    }

    /// Ask the master for a fresh full-state snapshot.
    pub fn request_resync(&self) -> Result<()> {
        match self.inner.outbound.read().as_ref() {
            Some(tx) => tx
                .send(SyncMessage::state_sync_request())
                .map_err(|_| SyncError::PeerGone),
            None => Err(SyncError::NotConnected),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.inner.state.read()
    }

    pub fn reconnection_status(&self) -> Option<ReconnectionStatus> {
        self.inner.reconnection.read().clone()
    }

    /// Number of scene items the expected-state projection tracks.
    pub fn tracked_items(&self) -> usize {
        self.inner.expected.read().item_count()
    }
}

impl SlaveInner {
    fn set_state(&self, state: LinkState) {
        *self.state.write() = state;
    }

    fn state(&self) -> LinkState {
        *self.state.read()
    }

    fn wants_connection(&self) -> bool {
        self.want_connected.load(Ordering::Acquire)
    }

    fn emit(&self, event: ShellEvent) {
        let _ = self.events.send(event);
    }
}

async fn supervisor(
    inner: Arc<SlaveInner>,
    host: String,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    let url = format!("ws://{}:{}", host, port);
    let mut failed_attempts: u32 = 0;
    let mut first_dial = true;

    loop {
        if *shutdown.borrow() || !inner.wants_connection() {
            break;
        }

        inner.set_state(if first_dial && failed_attempts == 0 {
            LinkState::Connecting
        } else {
            LinkState::Reconnecting
        });

        match timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
            Ok(Ok((ws, _))) => {
                first_dial = false;
                failed_attempts = 0;
                *inner.reconnection.write() = None;
                inner.set_state(LinkState::Connected);
                info!("✅ Connected to master at {}:{}", host, port);
                inner.emit(ShellEvent::SlaveConnectionStatus(true));

                run_connection(&inner, ws, &mut shutdown).await;

                *inner.outbound.write() = None;
                inner.emit(ShellEvent::SlaveConnectionStatus(false));
                if *shutdown.borrow() || !inner.wants_connection() {
                    break;
                }
                warn!("Connection to master lost");
                inner.set_state(LinkState::Reconnecting);
            }
            dial_result => {
                // An explicit disconnect may have landed mid-dial; do not
                // overwrite its clean state.
                if *shutdown.borrow() || !inner.wants_connection() {
                    break;
                }

                let error = match dial_result {
                    Err(_) => "connect timed out".to_string(),
                    Ok(Err(e)) => SyncError::from(e).to_string(),
                    Ok(Ok(_)) => unreachable!(),
                };

                failed_attempts += 1;
                if failed_attempts > MAX_RECONNECT_ATTEMPTS {
                    warn!(
                        "Giving up on master after {} attempts: {}",
                        MAX_RECONNECT_ATTEMPTS, error
                    );
                    *inner.reconnection.write() = Some(ReconnectionStatus {
                        is_reconnecting: false,
                        attempt_count: MAX_RECONNECT_ATTEMPTS,
                        max_attempts: MAX_RECONNECT_ATTEMPTS,
                        last_error: Some(error),
                        next_delay_secs: 0,
                    });
                    inner.set_state(LinkState::Disconnected);
                    return;
                }

                let delay = backoff_delay(failed_attempts - 1);
                info!(
                    "⏳ Reconnect #{} to master in {}s ({})",
                    failed_attempts,
                    delay.as_secs(),
                    error
                );
                inner.set_state(LinkState::Reconnecting);
                *inner.reconnection.write() = Some(ReconnectionStatus {
                    is_reconnecting: true,
                    attempt_count: failed_attempts,
                    max_attempts: MAX_RECONNECT_ATTEMPTS,
                    last_error: Some(error),
                    next_delay_secs: delay.as_secs(),
                });

                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    if inner.state() != LinkState::Disconnected {
        inner.set_state(LinkState::Disconnected);
    }
    debug!("Slave supervisor stopped");
}

/// Drive one established connection until it drops or is shut down.
async fn run_connection(
    inner: &Arc<SlaveInner>,
    ws: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    shutdown: &mut watch::Receiver<bool>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SyncMessage>();
    *inner.outbound.write() = Some(out_tx.clone());

    // Drift detection lives exactly as long as this connection.
    let (drift_stop, drift_stop_rx) = watch::channel(false);
    tokio::spawn(drift::run(
        inner.obs.clone(),
        Arc::clone(&inner.expected),
        inner.events.clone(),
        out_tx.clone(),
        drift_stop_rx,
    ));

    // Post-connect handshake: a short settling delay, then ask the master
    // for a full snapshot.
    let handshake_tx = out_tx.clone();
    let handshake = tokio::spawn(async move {
        tokio::time::sleep(HANDSHAKE_DELAY).await;
        let _ = handshake_tx.send(SyncMessage::state_sync_request());
    });

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
            Some(msg) = out_rx.recv() => {
                match msg.encode() {
                    Ok(raw) => {
                        if ws_tx.send(Message::Text(raw)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to encode {}: {}", msg.body.kind(), e),
                }
            }
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let bytes = text.len() as u64;
                    match SyncMessage::decode(&text) {
                        Ok(msg) => {
                            // Advisory only: master and slave clocks are
                            // not synchronized.
                            let latency = (chrono::Utc::now().timestamp_millis()
                                - msg.timestamp)
                                .max(0) as u64;
                            inner.metrics.record(latency, bytes);

                            if matches!(msg.body, MessageBody::Heartbeat(_)) {
                                // Echo so the master's idle reaper sees us.
                                let _ = out_tx.send(SyncMessage::heartbeat());
                            } else {
                                inner.applier.apply(&msg).await;
                            }
                        }
                        Err(e) => warn!("Bad frame from master: {}", e),
                    }
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Master socket error: {}", e);
                    break;
                }
            }
        }
    }

    let _ = drift_stop.send(true);
    handshake.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::MasterServer;
    use crate::protocol::SharedSyncTargets;
    use proptest::prelude::*;

    #[test]
    fn backoff_follows_min_of_power_and_cap() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(4), Duration::from_secs(16));
        assert_eq!(backoff_delay(5), Duration::from_secs(30));
        assert_eq!(backoff_delay(9), Duration::from_secs(30));
    }

    proptest! {
        #[test]
        fn backoff_matches_formula(n in 0u32..16) {
            let expected = 2u64.pow(n.min(10)).min(30);
            prop_assert_eq!(backoff_delay(n).as_secs(), expected);
        }
    }

    fn test_link() -> SlaveLink {
        let (events, _) = broadcast::channel(16);
        SlaveLink::new(ObsClient::new(), events, Arc::new(MetricsRecorder::new()))
    }

    async fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {}",
                what
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connects_and_reenters_reconnecting_when_master_dies() {
        let master = MasterServer::start(
            0,
            ObsClient::new(),
            SharedSyncTargets::default(),
            Arc::new(MetricsRecorder::new()),
        )
        .await
        .unwrap();

        let link = test_link();
        link.connect("127.0.0.1", master.port()).await.unwrap();

        wait_for(|| link.state() == LinkState::Connected, "link up").await;
        wait_for(|| master.client_count() == 1, "master side session").await;
        assert!(link.reconnection_status().is_none());

        master.stop().await;
        wait_for(
            || link.state() == LinkState::Reconnecting,
            "reconnecting after master exit",
        )
        .await;
        let status = link.reconnection_status().expect("reconnection tracked");
        assert!(status.is_reconnecting);
        assert!(status.attempt_count >= 1);
        assert_eq!(status.max_attempts, MAX_RECONNECT_ATTEMPTS);

        link.disconnect();
        assert_eq!(link.state(), LinkState::Disconnected);
        assert!(link.reconnection_status().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn explicit_disconnect_cancels_pending_reconnect() {
        let link = test_link();
        // Nothing listens on the discard port; dials fail fast.
        link.connect("127.0.0.1", 9).await.unwrap();

        wait_for(
            || link.reconnection_status().is_some(),
            "first failed dial",
        )
        .await;

        link.disconnect();
        assert_eq!(link.state(), LinkState::Disconnected);
        assert!(link.reconnection_status().is_none());
        assert!(matches!(
            link.request_resync(),
            Err(SyncError::NotConnected)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resync_request_needs_a_connection() {
        let link = test_link();
        assert!(matches!(
            link.request_resync(),
            Err(SyncError::NotConnected)
        ));
    }
}
