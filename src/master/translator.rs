//! OBS event to sync message translation.
//!
//! Subscribes to the local OBS event stream and turns each event into a
//! broadcast sync message, honoring the operator's target set. Translation
//! failures (unresolvable scenes, oversized images) drop the event with a
//! warning and never stop the loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use super::MasterInner;
use crate::error::{Result, SyncError};
use crate::obs::types::TransformPatch;
use crate::obs::{ObsClient, ObsEvent};
use crate::protocol::{
    ImageUpdatePayload, MessageBody, SceneChangePayload, SharedSyncTargets, SourceItem,
    SourceUpdatePayload, SyncMessage, SyncTargetType, TransformUpdatePayload,
    FilterUpdatePayload, MAX_IMAGE_BYTES,
};

/// Run the translation loop until the master shuts down. Mirrors the OBS
/// event-listener pattern: when the subscription ends (OBS went away), wait
/// and take a fresh one.
pub(super) async fn run(
    obs: ObsClient,
    master: Arc<MasterInner>,
    targets: SharedSyncTargets,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut translator = Translator {
        obs: obs.clone(),
        targets,
        item_names: HashMap::new(),
    };

    loop {
        let mut events = match obs.events().await {
            Ok(stream) => stream,
            Err(_) => {
                // OBS not connected yet; retry shortly.
                tokio::select! {
                    _ = shutdown.changed() => if *shutdown.borrow() { return },
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                continue;
            }
        };
        debug!("Translator subscribed to OBS events");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Translator shutting down");
                        return;
                    }
                }
                event = events.next() => match event {
                    Some(event) => {
                        if let Some(msg) = translator.translate(event).await {
                            master.broadcast(msg);
                        }
                    }
                    None => {
                        warn!("OBS event stream closed, waiting for reconnection...");
                        tokio::select! {
                            _ = shutdown.changed() => if *shutdown.borrow() { return },
                            _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                        }
                        break;
                    }
                }
            }
        }
    }
}

struct Translator {
    obs: ObsClient,
    targets: SharedSyncTargets,
    /// `(sceneName, sceneItemId)` -> source name, refreshed on miss.
    item_names: HashMap<(String, i64), String>,
}

impl Translator {
    async fn translate(&mut self, event: ObsEvent) -> Option<SyncMessage> {
        let targets = self.targets.load();

        match event {
            ObsEvent::CurrentProgramSceneChanged { scene_name } => {
                if !targets.contains(SyncTargetType::Program) {
                    return None;
                }
                Some(SyncMessage::new(
                    SyncTargetType::Program,
                    MessageBody::SceneChange(SceneChangePayload { scene_name }),
                ))
            }

            ObsEvent::CurrentPreviewSceneChanged { scene_name } => {
                if !targets.contains(SyncTargetType::Preview) {
                    return None;
                }
                Some(SyncMessage::new(
                    SyncTargetType::Preview,
                    MessageBody::SceneChange(SceneChangePayload { scene_name }),
                ))
            }

            ObsEvent::SceneItemTransformChanged {
                scene_name,
                scene_item_id,
                transform,
            } => {
                if !targets.contains(SyncTargetType::Source) {
                    return None;
                }
                let source_name = match self.source_name_for(&scene_name, scene_item_id).await {
                    Some(name) => name,
                    None => {
                        warn!(
                            "Dropping transform for unknown item {} in '{}'",
                            scene_item_id, scene_name
                        );
                        return None;
                    }
                };
                Some(SyncMessage::new(
                    SyncTargetType::Source,
                    MessageBody::TransformUpdate(TransformUpdatePayload {
                        scene_name,
                        scene_item_id,
                        source_name,
                        transform: TransformPatch::from_full(&transform),
                    }),
                ))
            }

            ObsEvent::SourceFilterSettingsChanged {
                source_name,
                filter_name,
                filter_settings,
            } => {
                if !targets.contains(SyncTargetType::Source) {
                    return None;
                }
                // The event names only the source; find the first scene
                // item hosting it. No match means the filter lives on
                // something we do not sync: drop, do not retry.
                let (scene_name, scene_item_id) = match self.host_of(&source_name).await {
                    Some(host) => host,
                    None => {
                        warn!(
                            "Dropping filter update: no scene hosts source '{}'",
                            source_name
                        );
                        return None;
                    }
                };
                let filter_enabled = self
                    .obs
                    .filter(&source_name, &filter_name)
                    .await
                    .ok()
                    .map(|f| f.filter_enabled);
                Some(SyncMessage::new(
                    SyncTargetType::Source,
                    MessageBody::FilterUpdate(FilterUpdatePayload {
                        scene_name,
                        scene_item_id,
                        source_name,
                        filter_name,
                        filter_settings,
                        filter_enabled,
                    }),
                ))
            }

            ObsEvent::InputSettingsChanged {
                input_name,
                input_kind,
                input_settings,
            } => {
                if !targets.contains(SyncTargetType::Source) {
                    return None;
                }
                let scene_name = self.host_of(&input_name).await.map(|(scene, _)| scene);

                if input_kind.starts_with("image_") {
                    match self
                        .image_payload(scene_name, &input_name, &input_settings)
                        .await
                    {
                        Ok(payload) => Some(SyncMessage::new(
                            SyncTargetType::Source,
                            MessageBody::ImageUpdate(payload),
                        )),
                        Err(e) => {
                            warn!("Dropping image update for '{}': {}", input_name, e);
                            None
                        }
                    }
                } else {
                    Some(SyncMessage::new(
                        SyncTargetType::Source,
                        MessageBody::SourceUpdate(SourceUpdatePayload {
                            scene_name,
                            source_item: SourceItem {
                                source_name: input_name,
                                settings: input_settings,
                            },
                        }),
                    ))
                }
            }

            ObsEvent::Unhandled { event_type } => {
                trace!("Translator ignoring {}", event_type);
                None
            }
        }
    }

    /// Resolve an item id to its source name, refreshing the per-scene
    /// cache on miss.
    async fn source_name_for(&mut self, scene_name: &str, scene_item_id: i64) -> Option<String> {
        let key = (scene_name.to_string(), scene_item_id);
        if let Some(name) = self.item_names.get(&key) {
            return Some(name.clone());
        }

        let items = self.obs.list_scene_items(scene_name).await.ok()?;
        for item in items {
            self.item_names.insert(
                (scene_name.to_string(), item.scene_item_id),
                item.source_name,
            );
        }
        self.item_names.get(&key).cloned()
    }

    /// First `(scene, itemId)` hosting the given source, in scene order.
    async fn host_of(&mut self, source_name: &str) -> Option<(String, i64)> {
        let scenes = self.obs.list_scenes().await.ok()?;
        for scene in scenes {
            let Ok(items) = self.obs.list_scene_items(&scene.scene_name).await else {
                continue;
            };
            for item in items {
                self.item_names.insert(
                    (scene.scene_name.clone(), item.scene_item_id),
                    item.source_name.clone(),
                );
                if item.source_name == source_name {
                    return Some((scene.scene_name, item.scene_item_id));
                }
            }
        }
        None
    }

    /// Stage the image file named by the new settings into a payload.
    async fn image_payload(
        &self,
        scene_name: Option<String>,
        source_name: &str,
        settings: &serde_json::Value,
    ) -> Result<ImageUpdatePayload> {
        let file = settings["file"]
            .as_str()
            .ok_or_else(|| SyncError::ApplyFailed("image settings carry no file".into()))?;

        let meta = tokio::fs::metadata(file).await?;
        if meta.len() > MAX_IMAGE_BYTES {
            return Err(SyncError::ImageTooLarge {
                size: meta.len(),
                limit: MAX_IMAGE_BYTES,
            });
        }

        let bytes = tokio::fs::read(file).await?;
        Ok(ImageUpdatePayload::from_bytes(
            scene_name,
            source_name.to_string(),
            file.to_string(),
            &bytes,
        ))
    }
}
