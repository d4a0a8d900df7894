//! OBS Studio WebSocket client.
//!
//! A typed wrapper over the obs-websocket v5 protocol exposing exactly the
//! operations the sync engine needs: scene and scene-item queries, transform
//! reads/writes, input settings, filters, and the event subscription used by
//! the master's translator and the slave's drift detector.

mod connection;
pub mod events;
pub mod types;

pub use connection::EventStream;
pub use events::ObsEvent;

use parking_lot::RwLock as SyncRwLock;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use connection::RawConnection;
use types::{
    FilterInfo, ObsConnectionStatus, ObsVersion, SceneInfo, SceneItemInfo, SceneItemTransform,
    SourceInfo, TransformPatch,
};

/// Handle to the local OBS instance. Cheap to clone; all clones share one
/// underlying connection.
#[derive(Clone, Default)]
pub struct ObsClient {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    conn: RwLock<Option<RawConnection>>,
    version: SyncRwLock<Option<ObsVersion>>,
}

impl ObsClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect and authenticate, replacing any previous connection.
    pub async fn connect(&self, host: &str, port: u16, password: Option<&str>) -> Result<()> {
        info!("🎬 Connecting to OBS at {}:{}", host, port);
        let conn = RawConnection::open(host, port, password).await?;

        let version_data = conn.request("GetVersion", None).await?;
        let version: ObsVersion = serde_json::from_value(version_data)?;
        info!(
            "✅ OBS connected: OBS {} / obs-websocket {}",
            version.obs_version, version.obs_web_socket_version
        );

        *self.inner.version.write() = Some(version);
        if let Some(old) = self.inner.conn.write().await.replace(conn) {
            old.shutdown();
        }
        Ok(())
    }

    /// Close the connection. Idempotent.
    pub async fn disconnect(&self) {
        if let Some(conn) = self.inner.conn.write().await.take() {
            conn.shutdown();
            debug!("OBS connection closed");
        }
        *self.inner.version.write() = None;
    }

    pub async fn status(&self) -> ObsConnectionStatus {
        let connected = match self.inner.conn.read().await.as_ref() {
            Some(conn) => conn.is_alive(),
            None => false,
        };
        let version = self.inner.version.read().clone();
        ObsConnectionStatus {
            connected,
            obs_version: version.as_ref().map(|v| v.obs_version.clone()),
            ws_version: version.map(|v| v.obs_web_socket_version),
        }
    }

    /// Take a fresh event subscription. The stream ends when the
    /// connection closes and is not restartable.
    pub async fn events(&self) -> Result<EventStream> {
        let guard = self.inner.conn.read().await;
        let conn = guard.as_ref().ok_or(SyncError::NotConnected)?;
        Ok(conn.subscribe())
    }

    async fn request(&self, request_type: &str, data: Option<Value>) -> Result<Value> {
        let guard = self.inner.conn.read().await;
        let conn = guard.as_ref().ok_or(SyncError::NotConnected)?;
        conn.request(request_type, data).await
    }

    pub async fn list_scenes(&self) -> Result<Vec<SceneInfo>> {
        let data = self.request("GetSceneList", None).await?;
        let mut scenes: Vec<SceneInfo> =
            serde_json::from_value(data["scenes"].clone())?;
        // OBS lists scenes newest-first; index order is the UI order.
        scenes.sort_by_key(|s| s.scene_index);
        Ok(scenes)
    }

    pub async fn current_program_scene(&self) -> Result<String> {
        let data = self.request("GetCurrentProgramScene", None).await?;
        data["currentProgramSceneName"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| SyncError::Protocol("missing currentProgramSceneName".into()))
    }

    pub async fn set_current_program_scene(&self, scene_name: &str) -> Result<()> {
        self.request(
            "SetCurrentProgramScene",
            Some(json!({"sceneName": scene_name})),
        )
        .await
        .map(|_| ())
    }

    /// `None` when Studio Mode is disabled.
    pub async fn current_preview_scene(&self) -> Result<Option<String>> {
        match self.request("GetCurrentPreviewScene", None).await {
            Ok(data) => Ok(data["currentPreviewSceneName"].as_str().map(str::to_owned)),
            Err(SyncError::Protocol(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn set_current_preview_scene(&self, scene_name: &str) -> Result<()> {
        self.request(
            "SetCurrentPreviewScene",
            Some(json!({"sceneName": scene_name})),
        )
        .await
        .map(|_| ())
    }

    pub async fn studio_mode_enabled(&self) -> Result<bool> {
        let data = self.request("GetStudioModeEnabled", None).await?;
        Ok(data["studioModeEnabled"].as_bool().unwrap_or(false))
    }

    pub async fn list_scene_items(&self, scene_name: &str) -> Result<Vec<SceneItemInfo>> {
        let data = self
            .request("GetSceneItemList", Some(json!({"sceneName": scene_name})))
            .await?;
        Ok(serde_json::from_value(data["sceneItems"].clone())?)
    }

    /// Resolve a source to its local scene-item id.
    pub async fn scene_item_id(&self, scene_name: &str, source_name: &str) -> Result<i64> {
        let data = self
            .request(
                "GetSceneItemId",
                Some(json!({"sceneName": scene_name, "sourceName": source_name})),
            )
            .await
            .map_err(|e| match e {
                SyncError::Protocol(_) => {
                    SyncError::SceneResolutionFailed(source_name.to_string())
                }
                other => other,
            })?;
        data["sceneItemId"]
            .as_i64()
            .ok_or_else(|| SyncError::Protocol("missing sceneItemId".into()))
    }

    pub async fn transform(
        &self,
        scene_name: &str,
        scene_item_id: i64,
    ) -> Result<SceneItemTransform> {
        let data = self
            .request(
                "GetSceneItemTransform",
                Some(json!({"sceneName": scene_name, "sceneItemId": scene_item_id})),
            )
            .await?;
        Ok(serde_json::from_value(data["sceneItemTransform"].clone())?)
    }

    pub async fn set_transform(
        &self,
        scene_name: &str,
        scene_item_id: i64,
        patch: &TransformPatch,
    ) -> Result<()> {
        let body = patch.writable();
        if body.is_empty() {
            return Ok(());
        }
        self.request(
            "SetSceneItemTransform",
            Some(json!({
                "sceneName": scene_name,
                "sceneItemId": scene_item_id,
                "sceneItemTransform": serde_json::to_value(&body)?,
            })),
        )
        .await
        .map(|_| ())
    }

    /// Returns `(settings, input_kind)`.
    pub async fn input_settings(&self, input_name: &str) -> Result<(Value, String)> {
        let data = self
            .request("GetInputSettings", Some(json!({"inputName": input_name})))
            .await?;
        let kind = data["inputKind"].as_str().unwrap_or_default().to_string();
        Ok((data.get("inputSettings").cloned().unwrap_or(json!({})), kind))
    }

    /// Merge-apply input settings (`overlay: true` keeps unspecified keys).
    pub async fn set_input_settings(&self, input_name: &str, settings: Value) -> Result<()> {
        self.request(
            "SetInputSettings",
            Some(json!({
                "inputName": input_name,
                "inputSettings": settings,
                "overlay": true,
            })),
        )
        .await
        .map(|_| ())
    }

    pub async fn list_inputs(&self) -> Result<Vec<SourceInfo>> {
        let data = self.request("GetInputList", None).await?;
        Ok(serde_json::from_value(data["inputs"].clone())?)
    }

    pub async fn list_filters(&self, source_name: &str) -> Result<Vec<FilterInfo>> {
        let data = self
            .request(
                "GetSourceFilterList",
                Some(json!({"sourceName": source_name})),
            )
            .await?;
        let mut filters: Vec<FilterInfo> = serde_json::from_value(data["filters"].clone())?;
        filters.sort_by_key(|f| f.filter_index);
        Ok(filters)
    }

    pub async fn filter(&self, source_name: &str, filter_name: &str) -> Result<FilterInfo> {
        let data = self
            .request(
                "GetSourceFilter",
                Some(json!({"sourceName": source_name, "filterName": filter_name})),
            )
            .await?;
        let mut info: FilterInfo = serde_json::from_value(data)?;
        if info.filter_name.is_empty() {
            info.filter_name = filter_name.to_string();
        }
        Ok(info)
    }

    pub async fn set_filter_settings(
        &self,
        source_name: &str,
        filter_name: &str,
        settings: Value,
    ) -> Result<()> {
        self.request(
            "SetSourceFilterSettings",
            Some(json!({
                "sourceName": source_name,
                "filterName": filter_name,
                "filterSettings": settings,
                "overlay": true,
            })),
        )
        .await
        .map(|_| ())
    }

    pub async fn set_filter_enabled(
        &self,
        source_name: &str,
        filter_name: &str,
        enabled: bool,
    ) -> Result<()> {
        self.request(
            "SetSourceFilterEnabled",
            Some(json!({
                "sourceName": source_name,
                "filterName": filter_name,
                "filterEnabled": enabled,
            })),
        )
        .await
        .map(|_| ())
    }
}
