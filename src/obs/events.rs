//! OBS event subscription types.
//!
//! Events arrive as opcode-5 frames with an `eventType` tag and an opaque
//! `eventData` blob. Only the event classes the engine propagates are
//! parsed into typed variants; everything else is surfaced as `Unhandled`
//! so callers can trace it.

use serde_json::Value;

use super::types::SceneItemTransform;

/// obs-websocket event subscription bits.
pub(super) mod subscription {
    pub const SCENES: u32 = 1 << 2;
    pub const INPUTS: u32 = 1 << 3;
    pub const FILTERS: u32 = 1 << 5;
    pub const SCENE_ITEMS: u32 = 1 << 7;

    /// Everything the sync engine reacts to.
    pub const MASK: u32 = SCENES | INPUTS | FILTERS | SCENE_ITEMS;
}

/// Typed OBS events consumed by the engine.
#[derive(Debug, Clone)]
pub enum ObsEvent {
    CurrentProgramSceneChanged {
        scene_name: String,
    },
    CurrentPreviewSceneChanged {
        scene_name: String,
    },
    SceneItemTransformChanged {
        scene_name: String,
        scene_item_id: i64,
        transform: SceneItemTransform,
    },
    SourceFilterSettingsChanged {
        source_name: String,
        filter_name: String,
        filter_settings: Value,
    },
    InputSettingsChanged {
        input_name: String,
        input_kind: String,
        input_settings: Value,
    },
    Unhandled {
        event_type: String,
    },
}

impl ObsEvent {
    /// Build from a raw `eventType` / `eventData` pair. Returns `None`
    /// when a known event is missing required fields.
    pub(super) fn parse(event_type: &str, data: &Value) -> Option<Self> {
        let str_field = |name: &str| data.get(name)?.as_str().map(str::to_owned);

        match event_type {
            "CurrentProgramSceneChanged" => Some(Self::CurrentProgramSceneChanged {
                scene_name: str_field("sceneName")?,
            }),
            "CurrentPreviewSceneChanged" => Some(Self::CurrentPreviewSceneChanged {
                scene_name: str_field("sceneName")?,
            }),
            "SceneItemTransformChanged" => Some(Self::SceneItemTransformChanged {
                scene_name: str_field("sceneName")?,
                scene_item_id: data.get("sceneItemId")?.as_i64()?,
                transform: serde_json::from_value(data.get("sceneItemTransform")?.clone())
                    .ok()?,
            }),
            "SourceFilterSettingsChanged" => Some(Self::SourceFilterSettingsChanged {
                source_name: str_field("sourceName")?,
                filter_name: str_field("filterName")?,
                filter_settings: data
                    .get("filterSettings")
                    .cloned()
                    .unwrap_or(Value::Null),
            }),
            "InputSettingsChanged" => Some(Self::InputSettingsChanged {
                input_name: str_field("inputName")?,
                input_kind: str_field("inputKind").unwrap_or_default(),
                input_settings: data
                    .get("inputSettings")
                    .cloned()
                    .unwrap_or(Value::Null),
            }),
            other => Some(Self::Unhandled {
                event_type: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_program_scene_change() {
        let data = json!({"sceneName": "Main", "sceneUuid": "x"});
        match ObsEvent::parse("CurrentProgramSceneChanged", &data) {
            Some(ObsEvent::CurrentProgramSceneChanged { scene_name }) => {
                assert_eq!(scene_name, "Main");
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn parses_transform_change() {
        let data = json!({
            "sceneName": "Main",
            "sceneItemId": 3,
            "sceneItemTransform": {
                "positionX": 100.0,
                "positionY": 200.0,
                "scaleX": 1.0,
                "scaleY": 1.0
            }
        });
        match ObsEvent::parse("SceneItemTransformChanged", &data) {
            Some(ObsEvent::SceneItemTransformChanged {
                scene_name,
                scene_item_id,
                transform,
            }) => {
                assert_eq!(scene_name, "Main");
                assert_eq!(scene_item_id, 3);
                assert_eq!(transform.position_x, 100.0);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn missing_fields_yield_none() {
        let data = json!({"sceneItemId": 3});
        assert!(matches!(
            ObsEvent::parse("SceneItemTransformChanged", &data),
            None
        ));
    }

    #[test]
    fn unknown_event_is_unhandled() {
        let data = json!({});
        match ObsEvent::parse("StreamStateChanged", &data) {
            Some(ObsEvent::Unhandled { event_type }) => {
                assert_eq!(event_type, "StreamStateChanged");
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }
}
