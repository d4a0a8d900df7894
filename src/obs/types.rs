//! Typed OBS data structures shared across the engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Full scene-item transform as reported by OBS.
///
/// `width`/`height` are computed by OBS from the source size and scale;
/// they are read-only and never sent back in a write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SceneItemTransform {
    pub position_x: f64,
    pub position_y: f64,
    pub rotation: f64,
    pub scale_x: f64,
    pub scale_y: f64,
    pub width: f64,
    pub height: f64,
    /// OBS alignment bit flags (LEFT=1, RIGHT=2, TOP=4, BOTTOM=8, CENTER=0).
    pub alignment: u32,
    pub bounds_type: String,
    pub bounds_alignment: u32,
    pub bounds_width: f64,
    pub bounds_height: f64,
}

/// Partial transform: fields present overwrite, absent fields are left
/// alone. This is both the wire shape of a transform update and the body
/// accepted by `SetSceneItemTransform`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TransformPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale_x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale_y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alignment: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds_alignment: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds_width: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds_height: Option<f64>,
}

impl TransformPatch {
    /// Capture every field of a full transform.
    pub fn from_full(t: &SceneItemTransform) -> Self {
        Self {
            position_x: Some(t.position_x),
            position_y: Some(t.position_y),
            rotation: Some(t.rotation),
            scale_x: Some(t.scale_x),
            scale_y: Some(t.scale_y),
            width: Some(t.width),
            height: Some(t.height),
            alignment: Some(t.alignment),
            bounds_type: Some(t.bounds_type.clone()),
            bounds_alignment: Some(t.bounds_alignment),
            bounds_width: Some(t.bounds_width),
            bounds_height: Some(t.bounds_height),
        }
    }

    /// Overlay this patch onto `base`: present fields overwrite.
    pub fn merge_into(&self, base: &mut TransformPatch) {
        macro_rules! take {
            ($field:ident) => {
                if let Some(v) = self.$field.clone() {
                    base.$field = Some(v);
                }
            };
        }
        take!(position_x);
        take!(position_y);
        take!(rotation);
        take!(scale_x);
        take!(scale_y);
        take!(width);
        take!(height);
        take!(alignment);
        take!(bounds_type);
        take!(bounds_alignment);
        take!(bounds_width);
        take!(bounds_height);
    }

    /// Apply present fields onto a full transform.
    pub fn apply_to(&self, t: &mut SceneItemTransform) {
        macro_rules! take {
            ($field:ident) => {
                if let Some(v) = self.$field.clone() {
                    t.$field = v;
                }
            };
        }
        take!(position_x);
        take!(position_y);
        take!(rotation);
        take!(scale_x);
        take!(scale_y);
        take!(width);
        take!(height);
        take!(alignment);
        take!(bounds_type);
        take!(bounds_alignment);
        take!(bounds_width);
        take!(bounds_height);
    }

    /// Strip the fields OBS computes itself; `SetSceneItemTransform`
    /// rejects writes to them.
    pub fn writable(&self) -> Self {
        let mut patch = self.clone();
        patch.width = None;
        patch.height = None;
        patch
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One scene as listed by `GetSceneList`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneInfo {
    pub scene_name: String,
    #[serde(default)]
    pub scene_index: i64,
}

/// One scene item as listed by `GetSceneItemList`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneItemInfo {
    pub scene_item_id: i64,
    pub source_name: String,
    /// `None` for nested scenes and groups.
    #[serde(default)]
    pub input_kind: Option<String>,
    #[serde(default)]
    pub scene_item_transform: SceneItemTransform,
}

/// One filter on a source.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterInfo {
    /// Absent in `GetSourceFilter` responses; the caller fills it in.
    #[serde(default)]
    pub filter_name: String,
    pub filter_enabled: bool,
    #[serde(default)]
    pub filter_kind: String,
    #[serde(default)]
    pub filter_index: i64,
    #[serde(default)]
    pub filter_settings: Value,
}

/// One input as listed by `GetInputList`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    pub input_name: String,
    #[serde(default)]
    pub input_kind: String,
}

/// Version info captured during the handshake.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObsVersion {
    pub obs_version: String,
    pub obs_web_socket_version: String,
}

/// Connection status reported over the shell boundary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObsConnectionStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obs_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn transform_deserializes_from_obs_shape() {
        let raw = json!({
            "positionX": 100.0,
            "positionY": 200.5,
            "rotation": 0.0,
            "scaleX": 1.0,
            "scaleY": 1.0,
            "width": 1920.0,
            "height": 1080.0,
            "alignment": 5,
            "boundsType": "OBS_BOUNDS_NONE",
            "boundsAlignment": 0,
            "boundsWidth": 0.0,
            "boundsHeight": 0.0,
            "sourceWidth": 1920.0
        });

        let t: SceneItemTransform = serde_json::from_value(raw).unwrap();
        assert_eq!(t.position_x, 100.0);
        assert_eq!(t.position_y, 200.5);
        assert_eq!(t.alignment, 5);
        assert_eq!(t.bounds_type, "OBS_BOUNDS_NONE");
    }

    #[test]
    fn patch_merge_overwrites_only_present_fields() {
        let mut base = TransformPatch {
            position_x: Some(0.0),
            position_y: Some(0.0),
            scale_x: Some(1.0),
            ..Default::default()
        };

        let update = TransformPatch {
            position_x: Some(100.0),
            position_y: Some(200.0),
            ..Default::default()
        };
        update.merge_into(&mut base);

        assert_eq!(base.position_x, Some(100.0));
        assert_eq!(base.position_y, Some(200.0));
        assert_eq!(base.scale_x, Some(1.0));
    }

    #[test]
    fn patch_applies_onto_full_transform() {
        let mut full = SceneItemTransform {
            position_x: 10.0,
            scale_x: 2.0,
            ..Default::default()
        };

        let patch = TransformPatch {
            position_x: Some(50.0),
            rotation: Some(90.0),
            ..Default::default()
        };
        patch.apply_to(&mut full);

        assert_eq!(full.position_x, 50.0);
        assert_eq!(full.rotation, 90.0);
        assert_eq!(full.scale_x, 2.0);
    }

    #[test]
    fn writable_patch_drops_computed_fields() {
        let full = SceneItemTransform {
            width: 1920.0,
            height: 1080.0,
            ..Default::default()
        };
        let patch = TransformPatch::from_full(&full).writable();

        assert!(patch.width.is_none());
        assert!(patch.height.is_none());
        assert!(patch.position_x.is_some());

        let raw = serde_json::to_value(&patch).unwrap();
        assert!(raw.get("width").is_none());
        assert_eq!(raw["positionX"], 0.0);
    }
}
