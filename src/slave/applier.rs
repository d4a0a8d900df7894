//! Applies inbound sync messages to the local OBS instance.
//!
//! Messages are applied strictly in arrival order. Each message updates the
//! expected-state projection first, then drives OBS. Per-message failures
//! are logged and the applier moves on; a run of consecutive failures
//! raises a visible alert without breaking the session.

use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::state::{ExpectedState, ItemKey};
use crate::engine::{DesyncAlert, ShellEvent};
use crate::error::Result;
use crate::obs::types::TransformPatch;
use crate::obs::ObsClient;
use crate::paths;
use crate::protocol::{
    FilterUpdatePayload, ImageUpdatePayload, MessageBody, SceneChangePayload, SourceUpdatePayload,
    StateSyncPayload, Severity, SyncMessage, SyncTargetType, TransformUpdatePayload,
};

/// Consecutive apply failures that trigger an alert.
const FAILURE_ALERT_THRESHOLD: u32 = 5;

pub(crate) struct Applier {
    obs: ObsClient,
    expected: Arc<RwLock<ExpectedState>>,
    events: broadcast::Sender<ShellEvent>,
    consecutive_failures: AtomicU32,
}

impl Applier {
    pub fn new(
        obs: ObsClient,
        expected: Arc<RwLock<ExpectedState>>,
        events: broadcast::Sender<ShellEvent>,
    ) -> Self {
        Self {
            obs,
            expected,
            events,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Apply one message; never fails the session.
    pub async fn apply(&self, msg: &SyncMessage) {
        match self.dispatch(msg).await {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("Apply {} failed: {}", msg.body.kind(), e);
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures == FAILURE_ALERT_THRESHOLD {
                    let _ = self.events.send(ShellEvent::DesyncAlert(DesyncAlert::new(
                        None,
                        None,
                        format!(
                            "{} consecutive apply failures, last: {}",
                            failures, e
                        ),
                        Severity::Critical,
                    )));
                }
            }
        }
    }

    async fn dispatch(&self, msg: &SyncMessage) -> Result<()> {
        match &msg.body {
            MessageBody::SceneChange(payload) => {
                self.apply_scene_change(msg.target_type, payload).await
            }
            MessageBody::TransformUpdate(payload) => self.apply_transform(payload).await,
            MessageBody::FilterUpdate(payload) => self.apply_filter(payload).await,
            MessageBody::SourceUpdate(payload) => self.apply_source(payload).await,
            MessageBody::ImageUpdate(payload) => self.apply_image(payload).await,
            MessageBody::StateSync(payload) => self.apply_snapshot(payload).await,
            // Link-level traffic; nothing to apply.
            MessageBody::Heartbeat(_)
            | MessageBody::StateSyncRequest(_)
            | MessageBody::SlaveStatusReport(_) => Ok(()),
        }
    }

    async fn apply_scene_change(
        &self,
        target: SyncTargetType,
        payload: &SceneChangePayload,
    ) -> Result<()> {
        self.expected
            .write()
            .record_scene_change(target, &payload.scene_name);

        match target {
            SyncTargetType::Preview => {
                if let Err(e) = self
                    .obs
                    .set_current_preview_scene(&payload.scene_name)
                    .await
                {
                    // Without Studio Mode there is no preview scene; that
                    // is tolerated, not an alert.
                    if let Ok(false) = self.obs.studio_mode_enabled().await {
                        info!("Preview change skipped: Studio Mode is disabled");
                        return Ok(());
                    }
                    return Err(e);
                }
                Ok(())
            }
            _ => {
                self.obs
                    .set_current_program_scene(&payload.scene_name)
                    .await
            }
        }
    }

    async fn apply_transform(&self, payload: &TransformUpdatePayload) -> Result<()> {
        self.expected.write().record_transform(
            &payload.scene_name,
            &payload.source_name,
            &payload.transform,
        );

        // The master's item id is meaningless here; resolve locally.
        let item_id = self
            .obs
            .scene_item_id(&payload.scene_name, &payload.source_name)
            .await?;

        let mut current = self.obs.transform(&payload.scene_name, item_id).await?;
        payload.transform.apply_to(&mut current);
        self.obs
            .set_transform(
                &payload.scene_name,
                item_id,
                &TransformPatch::from_full(&current),
            )
            .await
    }

    async fn apply_filter(&self, payload: &FilterUpdatePayload) -> Result<()> {
        self.expected.write().record_filter(
            &payload.scene_name,
            &payload.source_name,
            &payload.filter_name,
            payload.filter_settings.clone(),
            payload.filter_enabled,
        );

        self.obs
            .set_filter_settings(
                &payload.source_name,
                &payload.filter_name,
                payload.filter_settings.clone(),
            )
            .await?;

        if let Some(enabled) = payload.filter_enabled {
            self.obs
                .set_filter_enabled(&payload.source_name, &payload.filter_name, enabled)
                .await?;
        }
        Ok(())
    }

    async fn apply_source(&self, payload: &SourceUpdatePayload) -> Result<()> {
        self.obs
            .set_input_settings(
                &payload.source_item.source_name,
                payload.source_item.settings.clone(),
            )
            .await
    }

    async fn apply_image(&self, payload: &ImageUpdatePayload) -> Result<()> {
        let bytes = payload.decode_bytes()?;
        let path = staged_path(&payload.source_name, &bytes);

        self.expected.write().record_image(
            payload.scene_name.as_deref(),
            &payload.source_name,
            path.clone(),
        );

        tokio::fs::write(&path, &bytes).await?;
        debug!(
            "Staged image for '{}' at {} ({} bytes)",
            payload.source_name,
            path.display(),
            bytes.len()
        );

        self.obs
            .set_input_settings(
                &payload.source_name,
                json!({"file": path.to_string_lossy()}),
            )
            .await
    }

    /// Apply a full snapshot in the defined order: per scene, per item:
    /// transform, image, filters (settings then enabled); then the preview
    /// scene, then the program scene. Item content is therefore up to date
    /// before the program switches.
    async fn apply_snapshot(&self, payload: &StateSyncPayload) -> Result<()> {
        info!(
            "Applying snapshot: {} scenes, program '{}'",
            payload.scenes.len(),
            payload.current_program_scene
        );

        // Decode and place image payloads up front so the expected state
        // can be replaced before any OBS mutation happens.
        let mut staged: HashMap<ItemKey, (PathBuf, Vec<u8>)> = HashMap::new();
        for scene in &payload.scenes {
            for item in &scene.items {
                let Some(image) = &item.image else { continue };
                let blob = ImageUpdatePayload {
                    scene_name: Some(scene.name.clone()),
                    source_name: item.source_name.clone(),
                    file: image.file.clone(),
                    data: image.data.clone(),
                    size: image.size,
                    width: None,
                    height: None,
                };
                match blob.decode_bytes() {
                    Ok(bytes) => {
                        let path = staged_path(&item.source_name, &bytes);
                        staged.insert(
                            (scene.name.clone(), item.source_name.clone()),
                            (path, bytes),
                        );
                    }
                    Err(e) => warn!(
                        "Snapshot image for '{}' is malformed: {}",
                        item.source_name, e
                    ),
                }
            }
        }

        let staged_paths: HashMap<ItemKey, PathBuf> = staged
            .iter()
            .map(|(key, (path, _))| (key.clone(), path.clone()))
            .collect();
        self.expected
            .write()
            .ingest_snapshot(payload, &staged_paths);

        for scene in &payload.scenes {
            for item in &scene.items {
                let item_id = match self
                    .obs
                    .scene_item_id(&scene.name, &item.source_name)
                    .await
                {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(
                            "Snapshot: '{}' not present in scene '{}': {}",
                            item.source_name, scene.name, e
                        );
                        continue;
                    }
                };

                // (1) transform
                match self.obs.transform(&scene.name, item_id).await {
                    Ok(mut current) => {
                        item.transform.apply_to(&mut current);
                        if let Err(e) = self
                            .obs
                            .set_transform(
                                &scene.name,
                                item_id,
                                &TransformPatch::from_full(&current),
                            )
                            .await
                        {
                            warn!(
                                "Snapshot: transform of '{}' failed: {}",
                                item.source_name, e
                            );
                        }
                    }
                    Err(e) => warn!(
                        "Snapshot: transform read of '{}' failed: {}",
                        item.source_name, e
                    ),
                }

                // (2) image
                if let Some((path, bytes)) =
                    staged.get(&(scene.name.clone(), item.source_name.clone()))
                {
                    if let Err(e) = self.write_and_point(&item.source_name, path, bytes).await {
                        warn!("Snapshot: image of '{}' failed: {}", item.source_name, e);
                    }
                }

                // (3) filters, in listed order
                for filter in &item.filters {
                    if let Err(e) = self
                        .obs
                        .set_filter_settings(
                            &item.source_name,
                            &filter.name,
                            filter.settings.clone(),
                        )
                        .await
                    {
                        warn!(
                            "Snapshot: filter '{}' of '{}' failed: {}",
                            filter.name, item.source_name, e
                        );
                        continue;
                    }
                    if let Err(e) = self
                        .obs
                        .set_filter_enabled(&item.source_name, &filter.name, filter.enabled)
                        .await
                    {
                        warn!(
                            "Snapshot: enabling filter '{}' of '{}' failed: {}",
                            filter.name, item.source_name, e
                        );
                    }
                }
            }
        }

        if let Some(preview) = &payload.current_preview_scene {
            self.apply_scene_change(
                SyncTargetType::Preview,
                &SceneChangePayload {
                    scene_name: preview.clone(),
                },
            )
            .await
            .unwrap_or_else(|e| warn!("Snapshot: preview scene failed: {}", e));
        }

        self.obs
            .set_current_program_scene(&payload.current_program_scene)
            .await?;

        info!("Snapshot applied");
        Ok(())
    }

    async fn write_and_point(
        &self,
        source_name: &str,
        path: &PathBuf,
        bytes: &[u8],
    ) -> Result<()> {
        tokio::fs::write(path, bytes).await?;
        self.obs
            .set_input_settings(source_name, json!({"file": path.to_string_lossy()}))
            .await
    }
}

/// File extension from the content's magic bytes; unknown content falls
/// back to `.bin` and the apply proceeds anyway.
pub(crate) fn sniff_extension(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        "png"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "jpg"
    } else if bytes.starts_with(b"GIF8") {
        "gif"
    } else if bytes.starts_with(b"BM") {
        "bmp"
    } else if bytes.len() >= 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        "webp"
    } else {
        "bin"
    }
}

/// Stable file stem derived from the source name, so repeated updates for
/// the same source overwrite the same file.
pub(crate) fn stable_file_stem(source_name: &str) -> String {
    let stem: String = source_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() {
        "source".to_string()
    } else {
        stem
    }
}

pub(crate) fn staged_path(source_name: &str, bytes: &[u8]) -> PathBuf {
    paths::staging_dir().join(format!(
        "{}.{}",
        stable_file_stem(source_name),
        sniff_extension(bytes)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_known_image_magics() {
        assert_eq!(sniff_extension(b"\x89PNG\r\n\x1a\n...."), "png");
        assert_eq!(sniff_extension(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00]), "jpg");
        assert_eq!(sniff_extension(b"GIF89a......"), "gif");
        assert_eq!(sniff_extension(b"BM\x00\x00\x00\x00"), "bmp");
        assert_eq!(sniff_extension(b"RIFF\x00\x00\x00\x00WEBPVP8 "), "webp");
    }

    #[test]
    fn unknown_magic_falls_back_to_bin() {
        assert_eq!(sniff_extension(b"not an image at all"), "bin");
        assert_eq!(sniff_extension(b""), "bin");
        // RIFF without the WEBP fourcc is not a webp.
        assert_eq!(sniff_extension(b"RIFF\x00\x00\x00\x00WAVEfmt "), "bin");
    }

    #[test]
    fn staged_path_is_stable_per_source() {
        let png = b"\x89PNG\r\n\x1a\n";
        assert_eq!(staged_path("Logo", png), staged_path("Logo", png));
        assert_eq!(
            staged_path("Logo", png).file_name().unwrap(),
            "Logo.png"
        );
        assert_eq!(
            staged_path("My Logo/2024", png).file_name().unwrap(),
            "My_Logo_2024.png"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn expected_state_is_updated_before_obs_errors_surface() {
        // Disconnected OBS client: every OBS call fails, but the
        // projection must still record the master's intent.
        let expected = Arc::new(RwLock::new(ExpectedState::new()));
        let (events, _keep) = broadcast::channel(16);
        let applier = Applier::new(ObsClient::new(), Arc::clone(&expected), events);

        let msg = SyncMessage::new(
            SyncTargetType::Program,
            MessageBody::SceneChange(SceneChangePayload {
                scene_name: "Main".to_string(),
            }),
        );
        applier.apply(&msg).await;

        assert_eq!(expected.read().program_scene.as_deref(), Some("Main"));
        assert_eq!(applier.consecutive_failures.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn consecutive_failures_raise_one_alert() {
        let expected = Arc::new(RwLock::new(ExpectedState::new()));
        let (events, mut rx) = broadcast::channel(16);
        let applier = Applier::new(ObsClient::new(), Arc::clone(&expected), events);

        let msg = SyncMessage::new(
            SyncTargetType::Program,
            MessageBody::SceneChange(SceneChangePayload {
                scene_name: "Main".to_string(),
            }),
        );
        for _ in 0..(FAILURE_ALERT_THRESHOLD + 2) {
            applier.apply(&msg).await;
        }

        let event = rx.try_recv().expect("one alert after the threshold");
        match event {
            ShellEvent::DesyncAlert(alert) => {
                assert_eq!(alert.severity, Severity::Critical);
                assert!(alert.message.contains("consecutive apply failures"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        // Exactly one alert, not one per failure past the threshold.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_image_never_touches_disk() {
        let expected = Arc::new(RwLock::new(ExpectedState::new()));
        let (events, _keep) = broadcast::channel(16);
        let applier = Applier::new(ObsClient::new(), Arc::clone(&expected), events);

        let mut payload = ImageUpdatePayload::from_bytes(
            Some("Main".to_string()),
            "Corrupt".to_string(),
            "x.png".to_string(),
            b"\x89PNG\r\n\x1a\n1234",
        );
        payload.size = 99_999;

        let msg = SyncMessage {
            body: MessageBody::ImageUpdate(payload),
            timestamp: 0,
            target_type: SyncTargetType::Source,
        };
        applier.apply(&msg).await;

        // Rejected before staging: no expected image, no file.
        assert!(expected.read().items().next().is_none());
        assert_eq!(applier.consecutive_failures.load(Ordering::Relaxed), 1);
    }
}
