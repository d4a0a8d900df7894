//! Error taxonomy for the sync engine.
//!
//! Command errors surface to the shell as structured strings; transport and
//! applier errors are logged and handled locally per component policy.

use thiserror::Error;

/// Result alias used throughout the core.
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

/// Everything that can go wrong inside the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("authentication rejected")]
    Auth,

    #[error("connection refused: {0}")]
    ConnectRefused(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("port {0} is already in use")]
    BindInUse(u16),

    #[error("no permission to bind port {0}")]
    BindPermission(u16),

    #[error("server is not running")]
    NotRunning,

    #[error("peer connection closed")]
    PeerGone,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("apply failed: {0}")]
    ApplyFailed(String),

    #[error("no scene hosts source '{0}'")]
    SceneResolutionFailed(String),

    #[error("image is {size} bytes, over the {limit} byte limit")]
    ImageTooLarge { size: u64, limit: u64 },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("not connected")]
    NotConnected,

    #[error("settings error: {0}")]
    Settings(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match err {
            WsError::Io(io) if io.kind() == std::io::ErrorKind::ConnectionRefused => {
                SyncError::ConnectRefused(io.to_string())
            }
            WsError::ConnectionClosed | WsError::AlreadyClosed => SyncError::PeerGone,
            other => SyncError::WebSocket(other.to_string()),
        }
    }
}
