//! Master-side transport.
//!
//! Accepts slave WebSocket connections, keeps one registered session per
//! slave, and fans sync messages out through per-session bounded queues so
//! a slow slave never blocks the others. A heartbeat timer doubles as the
//! liveness reaper.

pub mod session;
pub mod snapshot;
mod translator;

pub use session::{ClientInfo, SlaveStatus};

use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::metrics::MetricsRecorder;
use crate::obs::ObsClient;
use crate::protocol::{MessageBody, SharedSyncTargets, SyncMessage, SyncTargetType};
use session::{Enqueue, Session};

/// Master sends a heartbeat to every session this often.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// A send that cannot complete within this window closes the session.
const SEND_TIMEOUT: Duration = Duration::from_secs(15);
/// A peer silent for this long is reaped.
const IDLE_TIMEOUT_MILLIS: i64 = 30_000;
/// Best-effort drain window on stop.
const DRAIN_DEADLINE: Duration = Duration::from_secs(2);

/// Running master server. Cheap to clone.
#[derive(Clone)]
pub struct MasterServer {
    inner: Arc<MasterInner>,
}

pub(crate) struct MasterInner {
    port: u16,
    sessions: DashMap<String, Arc<Session>>,
    shutdown_tx: watch::Sender<bool>,
    obs: ObsClient,
    metrics: Arc<MetricsRecorder>,
    acceptor: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MasterServer {
    /// Bind the listening socket and start the acceptor, heartbeat, and
    /// translator tasks. Port 0 binds an ephemeral port; `port()` reports
    /// the actual one.
    pub async fn start(
        port: u16,
        obs: ObsClient,
        targets: SharedSyncTargets,
        metrics: Arc<MetricsRecorder>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AddrInUse => SyncError::BindInUse(port),
                std::io::ErrorKind::PermissionDenied => SyncError::BindPermission(port),
                _ => SyncError::Io(e),
            })?;
        let bound_port = listener.local_addr()?.port();

        let (shutdown_tx, _) = watch::channel(false);
        let inner = Arc::new(MasterInner {
            port: bound_port,
            sessions: DashMap::new(),
            shutdown_tx,
            obs: obs.clone(),
            metrics,
            acceptor: tokio::sync::Mutex::new(None),
        });

        let accept_handle = tokio::spawn(acceptor(Arc::clone(&inner), listener));
        *inner.acceptor.lock().await = Some(accept_handle);
        tokio::spawn(heartbeat_loop(Arc::clone(&inner)));
        tokio::spawn(translator::run(
            obs,
            Arc::clone(&inner),
            targets,
            inner.shutdown_tx.subscribe(),
        ));

        info!("🛰️  Master server listening on port {}", bound_port);
        Ok(Self { inner })
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Stop accepting, drain outbound queues best-effort, then close every
    /// session. The listening port is free once this returns.
    pub async fn stop(&self) {
        let _ = self.inner.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + DRAIN_DEADLINE;
        while tokio::time::Instant::now() < deadline {
            let drained = self
                .inner
                .sessions
                .iter()
                .all(|entry| entry.value().queue_len() == 0);
            if drained {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for entry in self.inner.sessions.iter() {
            entry.value().close();
        }
        self.inner.sessions.clear();

        // Wait for the acceptor to drop the listener so an immediate rebind
        // of the same port succeeds.
        if let Some(handle) = self.inner.acceptor.lock().await.take() {
            let _ = handle.await;
        }
        info!("Master server stopped");
    }

    /// Queue a message for every connected slave.
    pub fn broadcast(&self, msg: SyncMessage) {
        self.inner.broadcast(msg);
    }

    /// Queue a message for one slave.
    pub fn send_to(&self, client_id: &str, msg: SyncMessage) -> Result<()> {
        self.inner.send_to(client_id, msg)
    }

    pub fn client_count(&self) -> u32 {
        self.inner.sessions.len() as u32
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        let mut infos: Vec<_> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().info())
            .collect();
        infos.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        infos
    }

    pub fn slave_statuses(&self) -> Vec<SlaveStatus> {
        self.inner
            .sessions
            .iter()
            .filter_map(|entry| {
                let session = entry.value();
                session
                    .last_status
                    .read()
                    .as_ref()
                    .map(|(payload, reported_at)| SlaveStatus {
                        client_id: session.id.clone(),
                        is_synced: payload.is_synced,
                        desync_details: payload.desync_details.clone(),
                        reported_at: *reported_at,
                    })
            })
            .collect()
    }

    /// Build one snapshot and push it to all slaves, or to a single one.
    pub async fn resync(&self, client_id: Option<&str>) -> Result<()> {
        let payload = snapshot::build(&self.inner.obs).await?;
        let msg = SyncMessage::new(SyncTargetType::Source, MessageBody::StateSync(payload));
        match client_id {
            Some(id) => self.inner.send_to(id, msg),
            None => {
                self.inner.broadcast(msg);
                Ok(())
            }
        }
    }
}

impl MasterInner {
    fn broadcast(&self, msg: SyncMessage) {
        let mut to_close = Vec::new();
        for entry in self.sessions.iter() {
            if entry.value().enqueue(msg.clone()) == Enqueue::Disconnect {
                to_close.push(entry.key().clone());
            }
        }
        for id in to_close {
            self.drop_session(&id, "sustained queue overflow");
        }
    }

    fn send_to(&self, client_id: &str, msg: SyncMessage) -> Result<()> {
        let Some(session) = self.sessions.get(client_id).map(|s| Arc::clone(s.value())) else {
            return Err(SyncError::PeerGone);
        };
        if session.enqueue(msg) == Enqueue::Disconnect {
            self.drop_session(client_id, "sustained queue overflow");
        }
        Ok(())
    }

    fn drop_session(&self, client_id: &str, reason: &str) {
        if let Some((_, session)) = self.sessions.remove(client_id) {
            warn!("Closing session {}: {}", client_id, reason);
            session.close();
        }
    }
}

async fn acceptor(inner: Arc<MasterInner>, listener: TcpListener) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    tokio::spawn(handle_connection(Arc::clone(&inner), stream, remote));
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    debug!("Acceptor stopped");
}

async fn handle_connection(inner: Arc<MasterInner>, stream: TcpStream, remote: SocketAddr) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", remote, e);
            return;
        }
    };

    let mut client_id = Uuid::new_v4().simple().to_string();
    client_id.truncate(8);

    let session = Arc::new(Session::new(client_id.clone(), remote));
    inner.sessions.insert(client_id.clone(), Arc::clone(&session));
    info!("🔌 Slave connected: {} ({})", client_id, remote);

    let (ws_tx, ws_rx) = ws.split();
    tokio::spawn(sender_task(
        Arc::clone(&inner),
        Arc::clone(&session),
        ws_tx,
    ));
    reader_task(Arc::clone(&inner), Arc::clone(&session), ws_rx).await;

    session.close();
    inner.sessions.remove(&client_id);
    info!("👋 Slave disconnected: {}", client_id);
}

async fn sender_task(
    inner: Arc<MasterInner>,
    session: Arc<Session>,
    mut ws_tx: SplitSink<WebSocketStream<TcpStream>, Message>,
) {
    let mut closed = session.closed();
    loop {
        tokio::select! {
            _ = closed.changed() => {
                if *closed.borrow() {
                    break;
                }
            }
            msg = session.next_message() => {
                let raw = match msg.encode() {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!("Failed to encode {}: {}", msg.body.kind(), e);
                        continue;
                    }
                };
                let bytes = raw.len() as u64;

                match timeout(SEND_TIMEOUT, ws_tx.send(Message::Text(raw))).await {
                    Err(_) => {
                        warn!("Session {} send stalled, closing", session.id);
                        session.close();
                        break;
                    }
                    Ok(Err(e)) => {
                        debug!("Session {} send failed: {}", session.id, e);
                        session.close();
                        break;
                    }
                    Ok(Ok(())) => {
                        // Queue delay doubles as the master-side latency
                        // sample for this message.
                        let queued_for =
                            (chrono::Utc::now().timestamp_millis() - msg.timestamp).max(0);
                        inner.metrics.record(queued_for as u64, bytes);
                    }
                }
            }
        }
    }
    let _ = ws_tx.close().await;
}

async fn reader_task(
    inner: Arc<MasterInner>,
    session: Arc<Session>,
    mut ws_rx: SplitStream<WebSocketStream<TcpStream>>,
) {
    let mut closed = session.closed();
    loop {
        tokio::select! {
            _ = closed.changed() => {
                if *closed.borrow() {
                    break;
                }
            }
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    session.touch();
                    match SyncMessage::decode(&text) {
                        Ok(msg) => handle_inbound(&inner, &session, msg),
                        Err(e) => warn!("Session {} sent bad frame: {}", session.id, e),
                    }
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => session.touch(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Session {} socket error: {}", session.id, e);
                    break;
                }
            }
        }
    }
}

fn handle_inbound(inner: &Arc<MasterInner>, session: &Arc<Session>, msg: SyncMessage) {
    match msg.body {
        MessageBody::SlaveStatusReport(payload) => {
            if !payload.is_synced {
                debug!(
                    "Slave {} reports {} desync detail(s)",
                    session.id,
                    payload.desync_details.len()
                );
            }
            *session.last_status.write() =
                Some((payload, chrono::Utc::now().timestamp_millis()));
        }
        MessageBody::StateSyncRequest(_) => {
            info!("Snapshot requested by slave {}", session.id);
            let inner = Arc::clone(inner);
            let session = Arc::clone(session);
            tokio::spawn(async move {
                match snapshot::build(&inner.obs).await {
                    Ok(payload) => {
                        session.enqueue(SyncMessage::new(
                            SyncTargetType::Source,
                            MessageBody::StateSync(payload),
                        ));
                    }
                    Err(e) => warn!(
                        "Snapshot for slave {} failed: {}",
                        session.id, e
                    ),
                }
            });
        }
        MessageBody::Heartbeat(_) => {}
        other => debug!(
            "Ignoring unexpected {} from slave {}",
            other.kind(),
            session.id
        ),
    }
}

async fn heartbeat_loop(inner: Arc<MasterInner>) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let mut to_close = Vec::new();
                for entry in inner.sessions.iter() {
                    let session = entry.value();
                    if session.idle_millis() > IDLE_TIMEOUT_MILLIS {
                        to_close.push((entry.key().clone(), "idle for over 30s"));
                        continue;
                    }
                    if session.enqueue(SyncMessage::heartbeat()) == Enqueue::Disconnect {
                        to_close.push((entry.key().clone(), "sustained queue overflow"));
                    }
                }
                for (id, reason) in to_close {
                    inner.drop_session(&id, reason);
                }
            }
        }
    }
    debug!("Heartbeat loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DesyncDetail, SceneChangePayload, Severity, SlaveStatusPayload};
    use tokio_tungstenite::connect_async;

    async fn start_test_server() -> MasterServer {
        MasterServer::start(
            0,
            ObsClient::new(),
            SharedSyncTargets::default(),
            Arc::new(MetricsRecorder::new()),
        )
        .await
        .expect("ephemeral bind")
    }

    async fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while !cond() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {}",
                what
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn scene_msg(name: &str) -> SyncMessage {
        SyncMessage::new(
            SyncTargetType::Program,
            MessageBody::SceneChange(SceneChangePayload {
                scene_name: name.to_string(),
            }),
        )
    }

    /// Read frames until a non-heartbeat sync message arrives.
    async fn next_sync_message(
        ws: &mut WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    ) -> SyncMessage {
        loop {
            let frame = timeout(Duration::from_secs(3), ws.next())
                .await
                .expect("frame within deadline")
                .expect("stream open")
                .expect("frame ok");
            if let Message::Text(text) = frame {
                let msg = SyncMessage::decode(&text).expect("valid sync message");
                if !matches!(msg.body, MessageBody::Heartbeat(_)) {
                    return msg;
                }
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn registers_slaves_and_broadcasts_in_order() {
        let server = start_test_server().await;
        let url = format!("ws://127.0.0.1:{}", server.port());
        let (mut ws, _) = connect_async(url.as_str()).await.expect("dial master");

        wait_for(|| server.client_count() == 1, "session registration").await;
        let clients = server.clients();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].client_id.len(), 8);

        server.broadcast(scene_msg("One"));
        server.broadcast(scene_msg("Two"));

        let first = next_sync_message(&mut ws).await;
        let second = next_sync_message(&mut ws).await;
        match (&first.body, &second.body) {
            (MessageBody::SceneChange(a), MessageBody::SceneChange(b)) => {
                assert_eq!(a.scene_name, "One");
                assert_eq!(b.scene_name, "Two");
            }
            other => panic!("expected two scene changes, got {:?}", other),
        }

        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn records_slave_status_reports() {
        let server = start_test_server().await;
        let url = format!("ws://127.0.0.1:{}", server.port());
        let (mut ws, _) = connect_async(url.as_str()).await.expect("dial master");
        wait_for(|| server.client_count() == 1, "session registration").await;

        let report = SyncMessage::new(
            SyncTargetType::Source,
            MessageBody::SlaveStatusReport(SlaveStatusPayload {
                is_synced: false,
                desync_details: vec![DesyncDetail {
                    category: "transform".to_string(),
                    scene_name: Some("Main".to_string()),
                    source_name: Some("Cam".to_string()),
                    description: "positionX differs".to_string(),
                    severity: Severity::Warning,
                }],
            }),
        );
        ws.send(Message::Text(report.encode().unwrap()))
            .await
            .unwrap();

        wait_for(|| !server.slave_statuses().is_empty(), "status report").await;
        let statuses = server.slave_statuses();
        assert!(!statuses[0].is_synced);
        assert_eq!(statuses[0].desync_details.len(), 1);
        assert_eq!(statuses[0].desync_details[0].severity, Severity::Warning);

        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn peer_disconnect_unregisters_the_session() {
        let server = start_test_server().await;
        let url = format!("ws://127.0.0.1:{}", server.port());
        let (mut ws, _) = connect_async(url.as_str()).await.expect("dial master");
        wait_for(|| server.client_count() == 1, "session registration").await;

        ws.close(None).await.unwrap();
        wait_for(|| server.client_count() == 0, "session teardown").await;

        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_frees_the_port_for_immediate_restart() {
        let server = start_test_server().await;
        let port = server.port();
        server.stop().await;

        let restarted = MasterServer::start(
            port,
            ObsClient::new(),
            SharedSyncTargets::default(),
            Arc::new(MetricsRecorder::new()),
        )
        .await
        .expect("port is free right after stop");
        assert_eq!(restarted.port(), port);
        restarted.stop().await;
    }
}
