//! Full-state snapshot assembly on the master.
//!
//! Enumerates every scene in OBS order and gathers, per item, the transform,
//! the filter list with settings and enabled flags, and — for image sources —
//! the staged file bytes. Item-level failures are tolerated: a snapshot with
//! a hole beats no snapshot at all.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::obs::types::TransformPatch;
use crate::obs::ObsClient;
use crate::protocol::{
    FilterSnapshot, ImageBlobSnapshot, SceneItemSnapshot, SceneSnapshot, StateSyncPayload,
    MAX_IMAGE_BYTES,
};

/// Build a complete `state_sync` payload from the local OBS instance.
pub async fn build(obs: &ObsClient) -> Result<StateSyncPayload> {
    let current_program_scene = obs.current_program_scene().await?;
    let current_preview_scene = obs.current_preview_scene().await?;

    let mut scenes = Vec::new();
    for scene in obs.list_scenes().await? {
        let items = match obs.list_scene_items(&scene.scene_name).await {
            Ok(items) => items,
            Err(e) => {
                warn!(
                    "Snapshot: skipping scene '{}', item list failed: {}",
                    scene.scene_name, e
                );
                continue;
            }
        };

        let mut snapshots = Vec::with_capacity(items.len());
        for item in items {
            let filters = match obs.list_filters(&item.source_name).await {
                Ok(filters) => filters
                    .into_iter()
                    .map(|f| FilterSnapshot {
                        name: f.filter_name,
                        enabled: f.filter_enabled,
                        settings: f.filter_settings,
                    })
                    .collect(),
                Err(e) => {
                    warn!(
                        "Snapshot: filters of '{}' unavailable: {}",
                        item.source_name, e
                    );
                    Vec::new()
                }
            };

            let image = if item
                .input_kind
                .as_deref()
                .is_some_and(|kind| kind.starts_with("image_"))
            {
                match read_image(obs, &item.source_name).await {
                    Ok(image) => image,
                    Err(e) => {
                        warn!(
                            "Snapshot: image of '{}' not included: {}",
                            item.source_name, e
                        );
                        None
                    }
                }
            } else {
                None
            };

            snapshots.push(SceneItemSnapshot {
                source_name: item.source_name,
                scene_item_id: item.scene_item_id,
                source_type: item.input_kind,
                transform: TransformPatch::from_full(&item.scene_item_transform),
                filters,
                image,
            });
        }

        scenes.push(SceneSnapshot {
            name: scene.scene_name,
            items: snapshots,
        });
    }

    debug!(
        "Snapshot built: {} scenes, program '{}'",
        scenes.len(),
        current_program_scene
    );

    Ok(StateSyncPayload {
        current_program_scene,
        current_preview_scene,
        scenes,
    })
}

/// Read an image source's file into a Base64 blob, honoring the size cap.
async fn read_image(obs: &ObsClient, source_name: &str) -> Result<Option<ImageBlobSnapshot>> {
    let (settings, _) = obs.input_settings(source_name).await?;
    let Some(file) = settings["file"].as_str() else {
        return Ok(None);
    };

    let meta = tokio::fs::metadata(file).await?;
    if meta.len() > MAX_IMAGE_BYTES {
        return Err(SyncError::ImageTooLarge {
            size: meta.len(),
            limit: MAX_IMAGE_BYTES,
        });
    }

    let bytes = tokio::fs::read(file).await?;
    Ok(Some(ImageBlobSnapshot {
        file: file.to_string(),
        data: BASE64.encode(&bytes),
        size: bytes.len() as u64,
    }))
}
