//! Periodic drift detection on the slave.
//!
//! Every cycle, while connected and an expected state exists, the detector
//! compares the local OBS state against the master-originated projection:
//! program/preview scene (Critical on mismatch), presence of each synced
//! source (Warning when missing), and transforms within tolerance (Warning,
//! naming the differing fields). Filter settings and image content are
//! deliberately not checked: the former are opaque, the latter can differ
//! legitimately between runs.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, trace, warn};

use super::state::ExpectedState;
use crate::engine::{DesyncAlert, ShellEvent};
use crate::error::SyncError;
use crate::obs::types::{SceneItemTransform, TransformPatch};
use crate::obs::ObsClient;
use crate::protocol::{
    DesyncDetail, MessageBody, Severity, SlaveStatusPayload, SyncMessage, SyncTargetType,
};

/// Check cadence; status reports to the master are implicitly coalesced to
/// this rate.
pub(crate) const DRIFT_INTERVAL: Duration = Duration::from_secs(5);

/// Numeric transform fields may differ by up to this much without counting
/// as drift; discrete fields must match exactly.
pub(crate) const TRANSFORM_TOLERANCE: f64 = 0.5;

/// Run drift cycles until stopped.
pub(crate) async fn run(
    obs: ObsClient,
    expected: Arc<RwLock<ExpectedState>>,
    events: broadcast::Sender<ShellEvent>,
    outbound: mpsc::UnboundedSender<SyncMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(DRIFT_INTERVAL);
    // The immediate first tick would race the post-connect snapshot.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("Drift detector stopped");
                    return;
                }
            }
            _ = ticker.tick() => {
                let projection = expected.read().clone();
                if projection.is_empty() {
                    continue;
                }

                let details = match detect(&obs, &projection).await {
                    Some(details) => details,
                    // OBS unreachable; skip the cycle rather than report
                    // phantom drift.
                    None => continue,
                };

                for detail in &details {
                    trace!("Drift: {}", detail.description);
                    let _ = events.send(ShellEvent::DesyncAlert(DesyncAlert::new(
                        detail.scene_name.clone(),
                        detail.source_name.clone(),
                        detail.description.clone(),
                        detail.severity,
                    )));
                }

                let report = SyncMessage::new(
                    SyncTargetType::Source,
                    MessageBody::SlaveStatusReport(SlaveStatusPayload {
                        is_synced: details.is_empty(),
                        desync_details: details,
                    }),
                );
                if outbound.send(report).is_err() {
                    debug!("Drift detector: link gone, stopping");
                    return;
                }
            }
        }
    }
}

/// One full comparison pass. `None` when OBS cannot be queried at all.
async fn detect(obs: &ObsClient, expected: &ExpectedState) -> Option<Vec<DesyncDetail>> {
    let mut details = Vec::new();

    if let Some(want) = &expected.program_scene {
        match obs.current_program_scene().await {
            Ok(actual) => {
                if &actual != want {
                    details.push(DesyncDetail {
                        category: "scene".to_string(),
                        scene_name: Some(want.clone()),
                        source_name: None,
                        description: format!(
                            "program scene is '{}', expected '{}'",
                            actual, want
                        ),
                        severity: Severity::Critical,
                    });
                }
            }
            Err(e) => {
                warn!("Drift check skipped, OBS unavailable: {}", e);
                return None;
            }
        }
    }

    if let Some(want) = &expected.preview_scene {
        if let Ok(Some(actual)) = obs.current_preview_scene().await {
            if &actual != want {
                details.push(DesyncDetail {
                    category: "scene".to_string(),
                    scene_name: Some(want.clone()),
                    source_name: None,
                    description: format!(
                        "preview scene is '{}', expected '{}'",
                        actual, want
                    ),
                    severity: Severity::Critical,
                });
            }
        }
    }

    for ((scene, source), item) in expected.items() {
        // Sceneless placeholder entries cannot be located in OBS.
        if scene.is_empty() || item.transform.is_empty() {
            continue;
        }

        let item_id = match obs.scene_item_id(scene, source).await {
            Ok(id) => id,
            Err(SyncError::SceneResolutionFailed(_)) => {
                details.push(DesyncDetail {
                    category: "source".to_string(),
                    scene_name: Some(scene.clone()),
                    source_name: Some(source.clone()),
                    description: format!("source '{}' missing from scene '{}'", source, scene),
                    severity: Severity::Warning,
                });
                continue;
            }
            Err(_) => continue,
        };

        let Ok(actual) = obs.transform(scene, item_id).await else {
            continue;
        };

        let fields = compare_transform(&item.transform, &actual);
        if !fields.is_empty() {
            details.push(DesyncDetail {
                category: "transform".to_string(),
                scene_name: Some(scene.clone()),
                source_name: Some(source.clone()),
                description: format!("transform differs on {}", fields.join(", ")),
                severity: Severity::Warning,
            });
        }
    }

    Some(details)
}

/// Names of the fields on which `actual` drifts from the expectation.
/// Only fields the master actually synced are compared.
pub(crate) fn compare_transform(
    expected: &TransformPatch,
    actual: &SceneItemTransform,
) -> Vec<&'static str> {
    let mut fields = Vec::new();

    macro_rules! numeric {
        ($field:ident, $name:literal) => {
            if let Some(want) = expected.$field {
                if (want - actual.$field).abs() > TRANSFORM_TOLERANCE {
                    fields.push($name);
                }
            }
        };
    }
    macro_rules! discrete {
        ($field:ident, $name:literal) => {
            if let Some(want) = expected.$field {
                if want != actual.$field {
                    fields.push($name);
                }
            }
        };
    }

    numeric!(position_x, "positionX");
    numeric!(position_y, "positionY");
    numeric!(rotation, "rotation");
    numeric!(scale_x, "scaleX");
    numeric!(scale_y, "scaleY");
    numeric!(width, "width");
    numeric!(height, "height");
    numeric!(bounds_width, "boundsWidth");
    numeric!(bounds_height, "boundsHeight");
    discrete!(alignment, "alignment");
    discrete!(bounds_alignment, "boundsAlignment");
    if let Some(want) = &expected.bounds_type {
        if want != &actual.bounds_type {
            fields.push("boundsType");
        }
    }

    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actual_at(x: f64, y: f64) -> SceneItemTransform {
        SceneItemTransform {
            position_x: x,
            position_y: y,
            scale_x: 1.0,
            scale_y: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn within_tolerance_is_not_drift() {
        let expected = TransformPatch {
            position_x: Some(100.0),
            position_y: Some(200.0),
            scale_x: Some(1.0),
            ..Default::default()
        };
        let actual = SceneItemTransform {
            position_x: 100.5,
            position_y: 199.5,
            scale_x: 1.4,
            ..Default::default()
        };
        assert!(compare_transform(&expected, &actual).is_empty());
    }

    #[test]
    fn beyond_tolerance_names_the_fields() {
        let expected = TransformPatch {
            position_x: Some(100.0),
            position_y: Some(200.0),
            ..Default::default()
        };
        let fields = compare_transform(&expected, &actual_at(110.0, 200.0));
        assert_eq!(fields, vec!["positionX"]);

        let fields = compare_transform(&expected, &actual_at(110.0, 189.0));
        assert_eq!(fields, vec!["positionX", "positionY"]);
    }

    #[test]
    fn boundary_is_exclusive_at_exactly_half() {
        let expected = TransformPatch {
            position_x: Some(0.0),
            ..Default::default()
        };
        // Differing by exactly the tolerance is fine; just beyond is not.
        assert!(compare_transform(&expected, &actual_at(0.5, 0.0)).is_empty());
        assert!(!compare_transform(&expected, &actual_at(0.51, 0.0)).is_empty());
    }

    #[test]
    fn unsynced_fields_are_ignored() {
        let expected = TransformPatch {
            position_x: Some(0.0),
            ..Default::default()
        };
        // Actual has wild scale/rotation, but the master never synced them.
        let actual = SceneItemTransform {
            position_x: 0.0,
            rotation: 45.0,
            scale_x: 3.0,
            ..Default::default()
        };
        assert!(compare_transform(&expected, &actual).is_empty());
    }

    #[test]
    fn discrete_fields_compare_exactly() {
        let expected = TransformPatch {
            alignment: Some(5),
            bounds_type: Some("OBS_BOUNDS_NONE".to_string()),
            ..Default::default()
        };
        let mut actual = SceneItemTransform {
            alignment: 5,
            bounds_type: "OBS_BOUNDS_NONE".to_string(),
            ..Default::default()
        };
        assert!(compare_transform(&expected, &actual).is_empty());

        actual.alignment = 4;
        actual.bounds_type = "OBS_BOUNDS_STRETCH".to_string();
        assert_eq!(
            compare_transform(&expected, &actual),
            vec!["alignment", "boundsType"]
        );
    }
}
