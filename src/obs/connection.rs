//! Low-level obs-websocket v5 connection.
//!
//! Handles the Hello/Identify handshake (including challenge/response
//! authentication), pairs opcode-6 requests with opcode-7 responses through
//! a pending map, and fans opcode-5 events out on a broadcast channel. The
//! OBS socket interleaves responses freely, so pairing is strictly by
//! request id, never by arrival order.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::events::{subscription, ObsEvent};
use crate::error::{Result, SyncError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RPC_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CHANNEL_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingMap = Arc<DashMap<String, oneshot::Sender<Result<Value>>>>;

/// An identified connection with its pump tasks running.
pub(super) struct RawConnection {
    sender: mpsc::UnboundedSender<Message>,
    pending: PendingMap,
    event_tx: broadcast::Sender<ObsEvent>,
    closed_tx: Arc<watch::Sender<bool>>,
    alive: Arc<AtomicBool>,
}

/// Event stream handle: yields events until the connection closes, then
/// ends. Not restartable; reconnecting takes a fresh subscription.
pub struct EventStream {
    rx: broadcast::Receiver<ObsEvent>,
    closed: watch::Receiver<bool>,
}

impl EventStream {
    /// Next event, or `None` once the connection is gone.
    pub async fn next(&mut self) -> Option<ObsEvent> {
        loop {
            tokio::select! {
                res = self.rx.recv() => match res {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("OBS event subscriber lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                _ = self.closed.changed() => {
                    if *self.closed.borrow() {
                        return None;
                    }
                }
            }
        }
    }
}

impl RawConnection {
    /// Dial, handshake, and start the pump tasks.
    pub(super) async fn open(host: &str, port: u16, password: Option<&str>) -> Result<Self> {
        let url = format!("ws://{}:{}", host, port);
        debug!("Dialing OBS WebSocket at {}", url);

        let (mut ws, _) = timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| SyncError::Timeout("OBS connect"))?
            .map_err(SyncError::from)?;

        let hello = read_frame(&mut ws, "OBS hello").await?;
        if hello["op"].as_i64() != Some(0) {
            return Err(SyncError::Protocol(format!(
                "expected Hello, got op {}",
                hello["op"]
            )));
        }

        let identify = build_identify(&hello["d"], password)?;
        ws.send(Message::Text(identify.to_string())).await?;

        // The server answers Identified or closes the socket (bad auth).
        let identified = match read_frame(&mut ws, "OBS identify").await {
            Ok(frame) => frame,
            Err(SyncError::PeerGone) => return Err(SyncError::Auth),
            Err(e) => return Err(e),
        };
        if identified["op"].as_i64() != Some(2) {
            return Err(SyncError::Protocol(format!(
                "expected Identified, got op {}",
                identified["op"]
            )));
        }
        debug!(
            "OBS identified, negotiated rpc version {}",
            identified["d"]["negotiatedRpcVersion"]
        );

        let (ws_tx, ws_rx) = ws.split();
        let (sender, outbound_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(DashMap::new());
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let closed_tx = Arc::new(watch::channel(false).0);
        let alive = Arc::new(AtomicBool::new(true));

        tokio::spawn(write_pump(ws_tx, outbound_rx));
        tokio::spawn(read_pump(
            ws_rx,
            sender.clone(),
            Arc::clone(&pending),
            event_tx.clone(),
            Arc::clone(&closed_tx),
            Arc::clone(&alive),
        ));

        Ok(Self {
            sender,
            pending,
            event_tx,
            closed_tx,
            alive,
        })
    }

    pub(super) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Issue one request and await its response.
    pub(super) async fn request(&self, request_type: &str, data: Option<Value>) -> Result<Value> {
        if !self.is_alive() {
            return Err(SyncError::NotConnected);
        }

        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);

        let mut d = json!({
            "requestType": request_type,
            "requestId": request_id.as_str(),
        });
        if let Some(data) = data {
            d["requestData"] = data;
        }

        let frame = json!({"op": 6, "d": d}).to_string();
        trace!("OBS request {}: {}", request_type, frame);
        if self.sender.send(Message::Text(frame)).is_err() {
            self.pending.remove(&request_id);
            return Err(SyncError::PeerGone);
        }

        match timeout(RPC_TIMEOUT, rx).await {
            Err(_) => {
                self.pending.remove(&request_id);
                Err(SyncError::Timeout("OBS request"))
            }
            Ok(Err(_)) => Err(SyncError::PeerGone),
            Ok(Ok(result)) => result,
        }
    }

    pub(super) fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.event_tx.subscribe(),
            closed: self.closed_tx.subscribe(),
        }
    }

    /// Best-effort close; idempotent.
    pub(super) fn shutdown(&self) {
        let _ = self.sender.send(Message::Close(None));
        self.alive.store(false, Ordering::Release);
        let _ = self.closed_tx.send(true);
    }
}

impl Drop for RawConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// obs-websocket v5 auth string:
/// `base64(sha256(base64(sha256(password + salt)) + challenge))`.
fn auth_response(password: &str, salt: &str, challenge: &str) -> String {
    let secret = BASE64.encode(Sha256::digest(format!("{}{}", password, salt)));
    BASE64.encode(Sha256::digest(format!("{}{}", secret, challenge)))
}

fn build_identify(hello: &Value, password: Option<&str>) -> Result<Value> {
    let mut d = json!({
        "rpcVersion": 1,
        "eventSubscriptions": subscription::MASK,
    });

    if let Some(auth) = hello.get("authentication") {
        let password = password.ok_or(SyncError::Auth)?;
        let challenge = auth["challenge"].as_str().unwrap_or_default();
        let salt = auth["salt"].as_str().unwrap_or_default();
        d["authentication"] = Value::String(auth_response(password, salt, challenge));
    }

    Ok(json!({"op": 1, "d": d}))
}

/// Read the next text frame during the handshake phase.
async fn read_frame(ws: &mut WsStream, what: &'static str) -> Result<Value> {
    loop {
        let frame = timeout(CONNECT_TIMEOUT, ws.next())
            .await
            .map_err(|_| SyncError::Timeout(what))?;
        match frame {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(&text)
                    .map_err(|e| SyncError::Protocol(e.to_string()));
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return Err(SyncError::PeerGone),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn write_pump(
    mut ws_tx: SplitSink<WsStream, Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = outbound_rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if ws_tx.send(message).await.is_err() || closing {
            break;
        }
    }
    debug!("OBS write pump stopped");
}

async fn read_pump(
    mut ws_rx: SplitStream<WsStream>,
    sender: mpsc::UnboundedSender<Message>,
    pending: PendingMap,
    event_tx: broadcast::Sender<ObsEvent>,
    closed_tx: Arc<watch::Sender<bool>>,
    alive: Arc<AtomicBool>,
) {
    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Ok(value) = serde_json::from_str::<Value>(&text) {
                    handle_frame(&value, &pending, &event_tx);
                } else {
                    warn!("OBS sent unparseable frame, ignoring");
                }
            }
            Ok(Message::Ping(payload)) => {
                let _ = sender.send(Message::Pong(payload));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("OBS socket error: {}", e);
                break;
            }
        }
    }

    alive.store(false, Ordering::Release);
    let _ = closed_tx.send(true);
    for entry in pending.iter().map(|e| e.key().clone()).collect::<Vec<_>>() {
        if let Some((_, tx)) = pending.remove(&entry) {
            let _ = tx.send(Err(SyncError::PeerGone));
        }
    }
    debug!("OBS read pump stopped");
}

fn handle_frame(value: &Value, pending: &PendingMap, event_tx: &broadcast::Sender<ObsEvent>) {
    match value["op"].as_i64() {
        // RequestResponse
        Some(7) => {
            let d = &value["d"];
            let Some(request_id) = d["requestId"].as_str() else {
                return;
            };
            let Some((_, tx)) = pending.remove(request_id) else {
                trace!("OBS response for unknown request {}", request_id);
                return;
            };

            let status = &d["requestStatus"];
            let result = if status["result"].as_bool() == Some(true) {
                Ok(d.get("responseData").cloned().unwrap_or(json!({})))
            } else {
                Err(SyncError::Protocol(format!(
                    "{} (code {})",
                    status["comment"].as_str().unwrap_or("request failed"),
                    status["code"]
                )))
            };
            let _ = tx.send(result);
        }
        // Event
        Some(5) => {
            let d = &value["d"];
            let Some(event_type) = d["eventType"].as_str() else {
                return;
            };
            let data = d.get("eventData").cloned().unwrap_or(json!({}));
            match ObsEvent::parse(event_type, &data) {
                Some(ObsEvent::Unhandled { event_type }) => {
                    trace!("Ignoring OBS event {}", event_type);
                }
                Some(event) => {
                    let _ = event_tx.send(event);
                }
                None => warn!("OBS event {} missing required fields", event_type),
            }
        }
        other => trace!("Ignoring OBS frame with op {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_response_is_deterministic() {
        let a = auth_response("secret", "salt", "challenge");
        let b = auth_response("secret", "salt", "challenge");
        assert_eq!(a, b);
        // sha256 output is 32 bytes -> 44 base64 chars.
        assert_eq!(a.len(), 44);
        assert_ne!(a, auth_response("other", "salt", "challenge"));
    }

    #[test]
    fn identify_without_auth_when_server_does_not_require_it() {
        let hello = serde_json::json!({"obsWebSocketVersion": "5.4.2", "rpcVersion": 1});
        let identify = build_identify(&hello, None).unwrap();
        assert_eq!(identify["op"], 1);
        assert_eq!(identify["d"]["rpcVersion"], 1);
        assert!(identify["d"].get("authentication").is_none());
    }

    #[test]
    fn identify_requires_password_when_server_demands_auth() {
        let hello = serde_json::json!({
            "authentication": {"challenge": "c", "salt": "s"}
        });
        assert!(matches!(
            build_identify(&hello, None),
            Err(SyncError::Auth)
        ));

        let identify = build_identify(&hello, Some("pw")).unwrap();
        assert!(identify["d"]["authentication"].is_string());
    }
}
