//! The sync engine and its shell boundary.
//!
//! `SyncEngine` is the single handle the shell talks to: every boundary
//! command is a method here, and shell-bound events flow out of one
//! broadcast channel. No global singletons; tasks receive engine clones.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::master::{ClientInfo, MasterServer, SlaveStatus};
use crate::metrics::{MetricsRecorder, PerfMetrics};
use crate::obs::types::{ObsConnectionStatus, SourceInfo};
use crate::obs::ObsClient;
use crate::protocol::{Severity, SharedSyncTargets, SyncTargetSet, SyncTargetType};
use crate::settings::AppSettings;
use crate::slave::{LinkState, ReconnectionStatus, SlaveLink};
use crate::{paths, settings};

/// Which role this node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppMode {
    Master,
    Slave,
}

/// Drift or apply-failure notification shown by the shell.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DesyncAlert {
    pub id: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    pub message: String,
    pub severity: Severity,
}

impl DesyncAlert {
    pub fn new(
        scene_name: Option<String>,
        source_name: Option<String>,
        message: String,
        severity: Severity,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            scene_name,
            source_name,
            message,
            severity,
        }
    }
}

/// Events pushed to the shell.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ShellEvent {
    SlaveConnectionStatus(bool),
    DesyncAlert(DesyncAlert),
}

/// Input for `connect_obs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObsConnectConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
}

impl From<&settings::ObsSettings> for ObsConnectConfig {
    fn from(s: &settings::ObsSettings) -> Self {
        Self {
            host: s.host.clone(),
            port: s.port,
            password: s.password.clone(),
        }
    }
}

/// The engine handle. Cheap to clone; pass clones into tasks.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    obs: ObsClient,
    mode: RwLock<Option<AppMode>>,
    targets: SharedSyncTargets,
    master: tokio::sync::Mutex<Option<MasterServer>>,
    slave: SlaveLink,
    metrics: Arc<MetricsRecorder>,
    events: broadcast::Sender<ShellEvent>,
}

impl SyncEngine {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        let obs = ObsClient::new();
        let metrics = Arc::new(MetricsRecorder::new());
        let slave = SlaveLink::new(obs.clone(), events.clone(), Arc::clone(&metrics));

        Self {
            inner: Arc::new(EngineInner {
                obs,
                mode: RwLock::new(None),
                targets: SharedSyncTargets::default(),
                master: tokio::sync::Mutex::new(None),
                slave,
                metrics,
                events,
            }),
        }
    }

    /// Subscribe to shell-bound events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ShellEvent> {
        self.inner.events.subscribe()
    }

    // ----- OBS -----

    pub async fn connect_obs(&self, config: &ObsConnectConfig) -> Result<()> {
        self.inner
            .obs
            .connect(&config.host, config.port, config.password.as_deref())
            .await
    }

    pub async fn disconnect_obs(&self) {
        self.inner.obs.disconnect().await;
    }

    pub async fn get_obs_status(&self) -> ObsConnectionStatus {
        self.inner.obs.status().await
    }

    pub async fn get_obs_sources(&self) -> Result<Vec<SourceInfo>> {
        self.inner.obs.list_inputs().await
    }

    // ----- Mode and targets -----

    pub fn set_app_mode(&self, mode: AppMode) {
        info!("App mode set to {:?}", mode);
        *self.inner.mode.write() = Some(mode);
    }

    pub fn get_app_mode(&self) -> Option<AppMode> {
        *self.inner.mode.read()
    }

    /// Takes effect on the next translated event.
    pub fn set_sync_targets(&self, targets: &[SyncTargetType]) {
        self.inner.targets.store(SyncTargetSet::from_slice(targets));
    }

    pub fn get_sync_targets(&self) -> Vec<SyncTargetType> {
        self.inner.targets.load().to_vec()
    }

    // ----- Master role -----

    pub async fn start_master_server(&self, port: u16) -> Result<()> {
        let mut guard = self.inner.master.lock().await;
        if guard.is_some() {
            return Err(SyncError::Unsupported(
                "master server already running".into(),
            ));
        }
        let server = MasterServer::start(
            port,
            self.inner.obs.clone(),
            self.inner.targets.clone(),
            Arc::clone(&self.inner.metrics),
        )
        .await?;
        *guard = Some(server);
        Ok(())
    }

    pub async fn stop_master_server(&self) -> Result<()> {
        match self.inner.master.lock().await.take() {
            Some(server) => {
                server.stop().await;
                Ok(())
            }
            None => Err(SyncError::NotRunning),
        }
    }

    pub async fn get_connected_clients_count(&self) -> u32 {
        match self.inner.master.lock().await.as_ref() {
            Some(server) => server.client_count(),
            None => 0,
        }
    }

    pub async fn get_connected_clients_info(&self) -> Vec<ClientInfo> {
        match self.inner.master.lock().await.as_ref() {
            Some(server) => server.clients(),
            None => Vec::new(),
        }
    }

    pub async fn get_slave_statuses(&self) -> Vec<SlaveStatus> {
        match self.inner.master.lock().await.as_ref() {
            Some(server) => server.slave_statuses(),
            None => Vec::new(),
        }
    }

    pub async fn resync_all_slaves(&self) -> Result<()> {
        let guard = self.inner.master.lock().await;
        let server = guard.as_ref().ok_or(SyncError::NotRunning)?;
        server.resync(None).await
    }

    pub async fn resync_specific_slave(&self, client_id: &str) -> Result<()> {
        let guard = self.inner.master.lock().await;
        let server = guard.as_ref().ok_or(SyncError::NotRunning)?;
        server.resync(Some(client_id)).await
    }

    // ----- Slave role -----

    pub async fn connect_to_master(&self, host: &str, port: u16) -> Result<()> {
        self.inner.slave.connect(host, port).await
    }

    pub fn disconnect_from_master(&self) {
        self.inner.slave.disconnect();
    }

    pub fn get_slave_link_state(&self) -> LinkState {
        self.inner.slave.state()
    }

    pub fn get_slave_reconnection_status(&self) -> Option<ReconnectionStatus> {
        self.inner.slave.reconnection_status()
    }

    pub fn request_resync_from_master(&self) -> Result<()> {
        self.inner.slave.request_resync()
    }

    // ----- Metrics, settings, misc -----

    pub fn get_performance_metrics(&self) -> PerfMetrics {
        self.inner.metrics.snapshot()
    }

    pub fn load_settings(&self) -> Result<AppSettings> {
        AppSettings::load(&paths::settings_file())
    }

    pub fn save_settings(&self, settings: &AppSettings) -> Result<()> {
        settings.save(&paths::settings_file())
    }

    pub fn app_version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Tear everything down: master server, upstream link, OBS connection.
    pub async fn shutdown(&self) {
        if let Some(server) = self.inner.master.lock().await.take() {
            server.stop().await;
        }
        self.inner.slave.disconnect();
        self.inner.obs.disconnect().await;
        info!("Engine shut down");
    }
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips() {
        let engine = SyncEngine::new();
        assert_eq!(engine.get_app_mode(), None);
        engine.set_app_mode(AppMode::Master);
        assert_eq!(engine.get_app_mode(), Some(AppMode::Master));
        engine.set_app_mode(AppMode::Slave);
        assert_eq!(engine.get_app_mode(), Some(AppMode::Slave));
    }

    #[test]
    fn sync_targets_default_and_update() {
        let engine = SyncEngine::new();
        let defaults = engine.get_sync_targets();
        assert!(defaults.contains(&SyncTargetType::Source));
        assert!(defaults.contains(&SyncTargetType::Program));
        assert!(!defaults.contains(&SyncTargetType::Preview));

        engine.set_sync_targets(&[SyncTargetType::Preview]);
        assert_eq!(engine.get_sync_targets(), vec![SyncTargetType::Preview]);
    }

    #[test]
    fn version_is_populated() {
        assert!(!SyncEngine::app_version().is_empty());
        assert!(!SyncEngine::git_commit().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn master_lifecycle_through_the_engine() {
        let engine = SyncEngine::new();
        assert!(matches!(
            engine.stop_master_server().await,
            Err(SyncError::NotRunning)
        ));

        engine.start_master_server(0).await.unwrap();
        assert!(matches!(
            engine.start_master_server(0).await,
            Err(SyncError::Unsupported(_))
        ));
        assert_eq!(engine.get_connected_clients_count().await, 0);

        engine.stop_master_server().await.unwrap();
        assert!(matches!(
            engine.stop_master_server().await,
            Err(SyncError::NotRunning)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resync_requires_a_running_master() {
        let engine = SyncEngine::new();
        assert!(matches!(
            engine.resync_all_slaves().await,
            Err(SyncError::NotRunning)
        ));
        assert!(matches!(
            engine.resync_specific_slave("nobody").await,
            Err(SyncError::NotRunning)
        ));
    }

    #[test]
    fn shell_events_serialize_with_kebab_case_tags() {
        let event = ShellEvent::SlaveConnectionStatus(true);
        let raw = serde_json::to_value(&event).unwrap();
        assert_eq!(raw["event"], "slave-connection-status");
        assert_eq!(raw["data"], true);

        let alert = ShellEvent::DesyncAlert(DesyncAlert::new(
            Some("Main".to_string()),
            Some("Cam".to_string()),
            "transform differs on positionX".to_string(),
            Severity::Warning,
        ));
        let raw = serde_json::to_value(&alert).unwrap();
        assert_eq!(raw["event"], "desync-alert");
        assert_eq!(raw["data"]["sceneName"], "Main");
        assert_eq!(raw["data"]["severity"], "warning");
        assert!(raw["data"]["id"].is_string());
    }
}
