//! Wire protocol between master and slaves.
//!
//! JSON over WebSocket text frames. Every message carries the same envelope:
//! `{ "type": <kind>, "timestamp": <ms-epoch>, "targetType": ..., "payload": ... }`.
//! Binary image content travels Base64-encoded inside the JSON payload.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::obs::types::TransformPatch;

/// Default port the master listens on for slave connections.
pub const DEFAULT_SYNC_PORT: u16 = 8455;

/// Upper bound for a single staged image payload.
pub const MAX_IMAGE_BYTES: u64 = 16 * 1024 * 1024;

/// Event classes an operator can enable for propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTargetType {
    Source,
    Preview,
    Program,
}

impl SyncTargetType {
    fn bit(self) -> u8 {
        match self {
            SyncTargetType::Source => 0b001,
            SyncTargetType::Preview => 0b010,
            SyncTargetType::Program => 0b100,
        }
    }
}

/// Operator-selected subset of target types. Messages whose target type is
/// not in the set are dropped on the master before enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTargetSet(u8);

impl SyncTargetSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn contains(self, target: SyncTargetType) -> bool {
        self.0 & target.bit() != 0
    }

    pub fn insert(&mut self, target: SyncTargetType) {
        self.0 |= target.bit();
    }

    pub fn from_slice(targets: &[SyncTargetType]) -> Self {
        let mut set = Self::empty();
        for t in targets {
            set.insert(*t);
        }
        set
    }

    pub fn to_vec(self) -> Vec<SyncTargetType> {
        [
            SyncTargetType::Source,
            SyncTargetType::Preview,
            SyncTargetType::Program,
        ]
        .into_iter()
        .filter(|t| self.contains(*t))
        .collect()
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0b111)
    }
}

impl Default for SyncTargetSet {
    /// Default is {Source, Program}; preview propagation is opt-in.
    fn default() -> Self {
        Self::from_slice(&[SyncTargetType::Source, SyncTargetType::Program])
    }
}

/// Process-wide handle to the operator's target set. Changes take effect on
/// the next translated event.
#[derive(Debug, Clone)]
pub struct SharedSyncTargets(std::sync::Arc<std::sync::atomic::AtomicU8>);

impl SharedSyncTargets {
    pub fn new(set: SyncTargetSet) -> Self {
        Self(std::sync::Arc::new(std::sync::atomic::AtomicU8::new(
            set.bits(),
        )))
    }

    pub fn load(&self) -> SyncTargetSet {
        SyncTargetSet::from_bits(self.0.load(std::sync::atomic::Ordering::Relaxed))
    }

    pub fn store(&self, set: SyncTargetSet) {
        self.0
            .store(set.bits(), std::sync::atomic::Ordering::Relaxed);
    }
}

impl Default for SharedSyncTargets {
    fn default() -> Self {
        Self::new(SyncTargetSet::default())
    }
}

/// One sync message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncMessage {
    #[serde(flatten)]
    pub body: MessageBody,
    /// Sender clock, milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(rename = "targetType")]
    pub target_type: SyncTargetType,
}

/// Message kinds and their payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MessageBody {
    SourceUpdate(SourceUpdatePayload),
    TransformUpdate(TransformUpdatePayload),
    SceneChange(SceneChangePayload),
    FilterUpdate(FilterUpdatePayload),
    ImageUpdate(ImageUpdatePayload),
    StateSync(StateSyncPayload),
    StateSyncRequest(EmptyPayload),
    Heartbeat(EmptyPayload),
    SlaveStatusReport(SlaveStatusPayload),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EmptyPayload {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceItem {
    pub source_name: String,
    /// Opaque OBS input settings blob.
    pub settings: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceUpdatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_name: Option<String>,
    pub source_item: SourceItem,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransformUpdatePayload {
    pub scene_name: String,
    /// Scene item id on the master. Not portable; slaves resolve by
    /// `(sceneName, sourceName)` and use their local id.
    pub scene_item_id: i64,
    pub source_name: String,
    pub transform: TransformPatch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SceneChangePayload {
    pub scene_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilterUpdatePayload {
    pub scene_name: String,
    pub scene_item_id: i64,
    pub source_name: String,
    pub filter_name: String,
    /// Opaque filter settings blob, merged on the slave.
    pub filter_settings: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageUpdatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_name: Option<String>,
    pub source_name: String,
    /// Path of the file on the master; informational only.
    pub file: String,
    /// Base64-encoded file content.
    pub data: String,
    /// Decoded size in bytes, validated against `data` on receipt.
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl ImageUpdatePayload {
    /// Decode the image bytes, checking the Base64 length against the
    /// stated byte size before doing the expensive decode.
    pub fn decode_bytes(&self) -> Result<Vec<u8>> {
        if self.data.len() % 4 != 0 {
            return Err(SyncError::MalformedPayload(
                "image data is not valid base64 (length)".into(),
            ));
        }
        // Base64 inflates 3 bytes to 4 chars; the stated size must fit.
        let max_decoded = self.data.len() / 4 * 3;
        let min_decoded = max_decoded.saturating_sub(2);
        if (self.size as usize) > max_decoded || (self.size as usize) < min_decoded {
            return Err(SyncError::MalformedPayload(format!(
                "stated image size {} does not fit base64 length {}",
                self.size,
                self.data.len()
            )));
        }

        let bytes = BASE64
            .decode(&self.data)
            .map_err(|e| SyncError::MalformedPayload(format!("image data: {}", e)))?;
        if bytes.len() as u64 != self.size {
            return Err(SyncError::MalformedPayload(format!(
                "image decoded to {} bytes, expected {}",
                bytes.len(),
                self.size
            )));
        }
        Ok(bytes)
    }

    /// Build a payload from raw file bytes.
    pub fn from_bytes(
        scene_name: Option<String>,
        source_name: String,
        file: String,
        bytes: &[u8],
    ) -> Self {
        Self {
            scene_name,
            source_name,
            file,
            data: BASE64.encode(bytes),
            size: bytes.len() as u64,
            width: None,
            height: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilterSnapshot {
    pub name: String,
    pub enabled: bool,
    pub settings: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageBlobSnapshot {
    pub file: String,
    pub data: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SceneItemSnapshot {
    pub source_name: String,
    pub scene_item_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    pub transform: TransformPatch,
    pub filters: Vec<FilterSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageBlobSnapshot>,
}

/// One scene in a full-state snapshot. Item order matters: apply must
/// iterate in this order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SceneSnapshot {
    pub name: String,
    pub items: Vec<SceneItemSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StateSyncPayload {
    pub current_program_scene: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_preview_scene: Option<String>,
    pub scenes: Vec<SceneSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DesyncDetail {
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    pub description: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SlaveStatusPayload {
    pub is_synced: bool,
    pub desync_details: Vec<DesyncDetail>,
}

impl MessageBody {
    /// Wire name of this kind, for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::SourceUpdate(_) => "source_update",
            MessageBody::TransformUpdate(_) => "transform_update",
            MessageBody::SceneChange(_) => "scene_change",
            MessageBody::FilterUpdate(_) => "filter_update",
            MessageBody::ImageUpdate(_) => "image_update",
            MessageBody::StateSync(_) => "state_sync",
            MessageBody::StateSyncRequest(_) => "state_sync_request",
            MessageBody::Heartbeat(_) => "heartbeat",
            MessageBody::SlaveStatusReport(_) => "slave_status_report",
        }
    }

    /// Key under which queued messages of this kind coalesce. Only
    /// transform updates coalesce; everything else must be delivered.
    pub fn coalesce_key(&self) -> Option<(&str, i64)> {
        match self {
            MessageBody::TransformUpdate(p) => Some((p.scene_name.as_str(), p.scene_item_id)),
            _ => None,
        }
    }

    /// Whether the queue may shed this message to relieve overflow. Only
    /// coalescable messages qualify: scene, filter, image, and snapshot
    /// messages must all be delivered or the session closed.
    pub fn droppable(&self) -> bool {
        self.coalesce_key().is_some()
    }
}

impl SyncMessage {
    /// Wrap a body with the current timestamp.
    pub fn new(target_type: SyncTargetType, body: MessageBody) -> Self {
        Self {
            body,
            timestamp: chrono::Utc::now().timestamp_millis(),
            target_type,
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(
            SyncTargetType::Source,
            MessageBody::Heartbeat(EmptyPayload {}),
        )
    }

    pub fn state_sync_request() -> Self {
        Self::new(
            SyncTargetType::Source,
            MessageBody::StateSyncRequest(EmptyPayload {}),
        )
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a text frame, rejecting unknown kinds and malformed image
    /// payloads.
    pub fn decode(raw: &str) -> Result<Self> {
        let msg: SyncMessage = serde_json::from_str(raw)
            .map_err(|e| SyncError::MalformedPayload(e.to_string()))?;

        if let MessageBody::ImageUpdate(ref image) = msg.body {
            if image.data.len() % 4 != 0
                || (image.size as usize) > image.data.len() / 4 * 3
            {
                return Err(SyncError::MalformedPayload(format!(
                    "image size {} does not fit base64 length {}",
                    image.size,
                    image.data.len()
                )));
            }
        }

        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_round_trips() {
        let msg = SyncMessage::new(
            SyncTargetType::Program,
            MessageBody::SceneChange(SceneChangePayload {
                scene_name: "Intermission".to_string(),
            }),
        );

        let raw = msg.encode().unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "scene_change");
        assert_eq!(value["targetType"], "program");
        assert_eq!(value["payload"]["sceneName"], "Intermission");
        assert!(value["timestamp"].is_i64());

        let back = SyncMessage::decode(&raw).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn unknown_kind_is_malformed() {
        let raw = json!({
            "type": "scene_delete",
            "timestamp": 1_700_000_000_000i64,
            "targetType": "program",
            "payload": {"sceneName": "Main"}
        })
        .to_string();

        assert!(matches!(
            SyncMessage::decode(&raw),
            Err(SyncError::MalformedPayload(_))
        ));
    }

    #[test]
    fn image_payload_round_trips_bytes() {
        let bytes = b"\x89PNG\r\n\x1a\nrest-of-image";
        let payload = ImageUpdatePayload::from_bytes(
            Some("Main".to_string()),
            "Logo".to_string(),
            "C:/assets/logo.png".to_string(),
            bytes,
        );

        assert_eq!(payload.size, bytes.len() as u64);
        assert_eq!(payload.decode_bytes().unwrap(), bytes);
    }

    #[test]
    fn image_size_mismatch_is_rejected() {
        let mut payload = ImageUpdatePayload::from_bytes(
            None,
            "Logo".to_string(),
            "logo.png".to_string(),
            b"0123456789",
        );
        payload.size = 4096;

        assert!(matches!(
            payload.decode_bytes(),
            Err(SyncError::MalformedPayload(_))
        ));

        let msg = SyncMessage::new(
            SyncTargetType::Source,
            MessageBody::ImageUpdate(payload),
        );
        let raw = msg.encode().unwrap();
        assert!(matches!(
            SyncMessage::decode(&raw),
            Err(SyncError::MalformedPayload(_))
        ));
    }

    #[test]
    fn only_transforms_coalesce() {
        let transform = MessageBody::TransformUpdate(TransformUpdatePayload {
            scene_name: "Main".to_string(),
            scene_item_id: 3,
            source_name: "Cam".to_string(),
            transform: TransformPatch::default(),
        });
        assert_eq!(transform.coalesce_key(), Some(("Main", 3)));
        assert!(transform.droppable());

        // Everything that does not coalesce must be delivered.
        let scene = MessageBody::SceneChange(SceneChangePayload {
            scene_name: "Main".to_string(),
        });
        assert_eq!(scene.coalesce_key(), None);
        assert!(!scene.droppable());

        let filter = MessageBody::FilterUpdate(FilterUpdatePayload {
            scene_name: "Main".to_string(),
            scene_item_id: 3,
            source_name: "Cam".to_string(),
            filter_name: "Color".to_string(),
            filter_settings: Value::Null,
            filter_enabled: None,
        });
        assert!(!filter.droppable());

        let image = MessageBody::ImageUpdate(ImageUpdatePayload::from_bytes(
            None,
            "Logo".to_string(),
            "logo.png".to_string(),
            b"BM123",
        ));
        assert!(!image.droppable());
    }

    #[test]
    fn target_set_defaults_and_bits() {
        let set = SyncTargetSet::default();
        assert!(set.contains(SyncTargetType::Source));
        assert!(set.contains(SyncTargetType::Program));
        assert!(!set.contains(SyncTargetType::Preview));

        let all = SyncTargetSet::from_slice(&[
            SyncTargetType::Source,
            SyncTargetType::Preview,
            SyncTargetType::Program,
        ]);
        assert_eq!(SyncTargetSet::from_bits(all.bits()), all);
        assert_eq!(all.to_vec().len(), 3);
    }
}
