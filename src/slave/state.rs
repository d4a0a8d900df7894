//! Cumulative projection of the master's intended state.
//!
//! Written only by the applier; the drift detector reads consistent copies.
//! Retained across momentary disconnects so drift checks keep working while
//! the link recovers.

use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::obs::types::TransformPatch;
use crate::protocol::{StateSyncPayload, SyncTargetType};

/// Identity of a synced scene item: `(sceneName, sourceName)`. Scene-item
/// ids are intentionally absent; they are not portable across instances.
pub type ItemKey = (String, String);

/// Last-known intended state of one scene item.
#[derive(Debug, Clone, Default)]
pub struct ExpectedItem {
    /// Fields the master has actually synced; unsynced fields stay `None`
    /// and are never drift-checked.
    pub transform: TransformPatch,
    pub filters: HashMap<String, ExpectedFilter>,
    pub image_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ExpectedFilter {
    pub enabled: Option<bool>,
    pub settings: Value,
}

/// The slave's view of what the master wants.
#[derive(Debug, Clone, Default)]
pub struct ExpectedState {
    pub program_scene: Option<String>,
    pub preview_scene: Option<String>,
    items: HashMap<ItemKey, ExpectedItem>,
}

impl ExpectedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.program_scene.is_none() && self.preview_scene.is_none() && self.items.is_empty()
    }

    pub fn record_scene_change(&mut self, target: SyncTargetType, scene_name: &str) {
        match target {
            SyncTargetType::Program => self.program_scene = Some(scene_name.to_string()),
            SyncTargetType::Preview => self.preview_scene = Some(scene_name.to_string()),
            SyncTargetType::Source => {}
        }
    }

    pub fn record_transform(&mut self, scene: &str, source: &str, patch: &TransformPatch) {
        let item = self.item_mut(scene, source);
        patch.merge_into(&mut item.transform);
    }

    pub fn record_filter(
        &mut self,
        scene: &str,
        source: &str,
        filter_name: &str,
        settings: Value,
        enabled: Option<bool>,
    ) {
        let item = self.item_mut(scene, source);
        let entry = item
            .filters
            .entry(filter_name.to_string())
            .or_insert(ExpectedFilter {
                enabled: None,
                settings: Value::Null,
            });
        entry.settings = settings;
        if enabled.is_some() {
            entry.enabled = enabled;
        }
    }

    pub fn record_image(&mut self, scene: Option<&str>, source: &str, path: PathBuf) {
        // Image updates without a scene attach to every scene already
        // tracking the source, or create a sceneless placeholder entry.
        match scene {
            Some(scene) => {
                self.item_mut(scene, source).image_path = Some(path);
            }
            None => {
                let mut hit = false;
                for ((_, item_source), item) in self.items.iter_mut() {
                    if item_source == source {
                        item.image_path = Some(path.clone());
                        hit = true;
                    }
                }
                if !hit {
                    self.item_mut("", source).image_path = Some(path);
                }
            }
        }
    }

    /// Replace the whole projection with a snapshot's content.
    /// `staged_images` maps `(scene, source)` to the locally staged path.
    pub fn ingest_snapshot(
        &mut self,
        payload: &StateSyncPayload,
        staged_images: &HashMap<ItemKey, PathBuf>,
    ) {
        self.items.clear();
        self.program_scene = Some(payload.current_program_scene.clone());
        self.preview_scene = payload.current_preview_scene.clone();

        for scene in &payload.scenes {
            for item in &scene.items {
                let entry = self.item_mut(&scene.name, &item.source_name);
                entry.transform = item.transform.clone();
                entry.filters = item
                    .filters
                    .iter()
                    .map(|f| {
                        (
                            f.name.clone(),
                            ExpectedFilter {
                                enabled: Some(f.enabled),
                                settings: f.settings.clone(),
                            },
                        )
                    })
                    .collect();
                entry.image_path = staged_images
                    .get(&(scene.name.clone(), item.source_name.clone()))
                    .cloned();
            }
        }
    }

    pub fn items(&self) -> impl Iterator<Item = (&ItemKey, &ExpectedItem)> {
        self.items.iter()
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    fn item_mut(&mut self, scene: &str, source: &str) -> &mut ExpectedItem {
        self.items
            .entry((scene.to_string(), source.to_string()))
            .or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FilterSnapshot, SceneItemSnapshot, SceneSnapshot};
    use serde_json::json;

    #[test]
    fn transform_records_accumulate() {
        let mut state = ExpectedState::new();

        state.record_transform(
            "Main",
            "Cam",
            &TransformPatch {
                position_x: Some(10.0),
                ..Default::default()
            },
        );
        state.record_transform(
            "Main",
            "Cam",
            &TransformPatch {
                position_y: Some(20.0),
                ..Default::default()
            },
        );

        let (_, item) = state
            .items()
            .find(|((_, source), _)| source == "Cam")
            .unwrap();
        assert_eq!(item.transform.position_x, Some(10.0));
        assert_eq!(item.transform.position_y, Some(20.0));
    }

    #[test]
    fn scene_changes_track_by_target() {
        let mut state = ExpectedState::new();
        state.record_scene_change(SyncTargetType::Program, "Main");
        state.record_scene_change(SyncTargetType::Preview, "Backstage");

        assert_eq!(state.program_scene.as_deref(), Some("Main"));
        assert_eq!(state.preview_scene.as_deref(), Some("Backstage"));
    }

    #[test]
    fn snapshot_ingest_replaces_projection() {
        let mut state = ExpectedState::new();
        state.record_transform("Old", "Gone", &TransformPatch::default());

        let payload = StateSyncPayload {
            current_program_scene: "Main".to_string(),
            current_preview_scene: None,
            scenes: vec![SceneSnapshot {
                name: "Main".to_string(),
                items: vec![SceneItemSnapshot {
                    source_name: "Cam".to_string(),
                    scene_item_id: 7,
                    source_type: Some("dshow_input".to_string()),
                    transform: TransformPatch {
                        position_x: Some(100.0),
                        ..Default::default()
                    },
                    filters: vec![FilterSnapshot {
                        name: "Color".to_string(),
                        enabled: true,
                        settings: json!({"gamma": 0.5}),
                    }],
                    image: None,
                }],
            }],
        };

        state.ingest_snapshot(&payload, &HashMap::new());

        assert_eq!(state.program_scene.as_deref(), Some("Main"));
        assert_eq!(state.item_count(), 1);
        let (key, item) = state.items().next().unwrap();
        assert_eq!(key.0, "Main");
        assert_eq!(key.1, "Cam");
        assert_eq!(item.transform.position_x, Some(100.0));
        assert_eq!(item.filters["Color"].enabled, Some(true));
    }

    #[test]
    fn sceneless_image_attaches_to_tracked_scenes() {
        let mut state = ExpectedState::new();
        state.record_transform("Main", "Logo", &TransformPatch::default());
        state.record_image(None, "Logo", PathBuf::from("/tmp/obs-sync/Logo.png"));

        let (key, item) = state.items().next().unwrap();
        assert_eq!(key.0, "Main");
        assert_eq!(
            item.image_path.as_deref(),
            Some(std::path::Path::new("/tmp/obs-sync/Logo.png"))
        );
    }
}
