//! Per-slave session state on the master.
//!
//! Each session owns a bounded outbound queue drained by its sender task.
//! Consecutive transform updates for the same scene item coalesce in place,
//! keeping the slot (and therefore cross-kind ordering). Overflow only ever
//! sheds transforms, the one coalescable kind; scene, filter, image, and
//! snapshot messages ride out the pressure until either the queue drains or
//! the session's owner closes it for overflowing persistently.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use tokio::sync::{watch, Notify};
use tracing::warn;

use crate::protocol::{SlaveStatusPayload, SyncMessage};

/// Outbound queue capacity per session.
pub const QUEUE_CAPACITY: usize = 256;

/// Consecutive overflow drops after which the session is closed.
pub const OVERFLOW_DISCONNECT_STREAK: u32 = 64;

/// Session descriptor exposed over the shell boundary.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub client_id: String,
    pub remote_address: String,
    /// Milliseconds since the Unix epoch.
    pub connected_at: i64,
    pub last_activity: i64,
}

/// Last sync status a slave reported, as shown in the master's client list.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SlaveStatus {
    pub client_id: String,
    pub is_synced: bool,
    pub desync_details: Vec<crate::protocol::DesyncDetail>,
    pub reported_at: i64,
}

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueue {
    Queued,
    /// Replaced an already queued transform for the same item.
    Coalesced,
    /// A transform was shed to relieve overflow, either the oldest queued
    /// one or the incoming one itself.
    Dropped,
    /// Overflowed persistently; the owner must close the session.
    Disconnect,
}

pub(crate) struct Session {
    pub id: String,
    pub remote: SocketAddr,
    pub connected_at: i64,
    last_activity: AtomicI64,
    queue: Mutex<VecDeque<SyncMessage>>,
    notify: Notify,
    overflow_streak: AtomicU32,
    close_tx: watch::Sender<bool>,
    pub last_status: RwLock<Option<(SlaveStatusPayload, i64)>>,
}

impl Session {
    pub fn new(id: String, remote: SocketAddr) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        let (close_tx, _) = watch::channel(false);
        Self {
            id,
            remote,
            connected_at: now,
            last_activity: AtomicI64::new(now),
            queue: Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY)),
            notify: Notify::new(),
            overflow_streak: AtomicU32::new(0),
            close_tx,
            last_status: RwLock::new(None),
        }
    }

    /// Queue a message for delivery, coalescing and shedding as needed.
    pub fn enqueue(&self, msg: SyncMessage) -> Enqueue {
        let key = msg
            .body
            .coalesce_key()
            .map(|(scene, id)| (scene.to_string(), id));

        let mut queue = self.queue.lock();

        if let Some(key) = key.as_ref() {
            let slot = queue.iter_mut().find(|queued| {
                queued
                    .body
                    .coalesce_key()
                    .is_some_and(|(scene, id)| (scene, id) == (key.0.as_str(), key.1))
            });
            if let Some(slot) = slot {
                *slot = msg;
                self.notify.notify_one();
                return Enqueue::Coalesced;
            }
        }

        if queue.len() >= QUEUE_CAPACITY {
            let streak = self.overflow_streak.fetch_add(1, Ordering::Relaxed) + 1;

            let outcome = match queue.iter().position(|queued| queued.body.droppable()) {
                Some(pos) => {
                    queue.remove(pos);
                    warn!(
                        "Session {} queue full, shed the oldest queued transform",
                        self.id
                    );
                    queue.push_back(msg);
                    Enqueue::Dropped
                }
                None if msg.body.droppable() => {
                    warn!(
                        "Session {} queue full with nothing coalescable queued, \
                         shedding the incoming transform",
                        self.id
                    );
                    Enqueue::Dropped
                }
                None => {
                    // Nothing here may be lost; run over capacity and let
                    // the overflow streak close the session instead.
                    warn!(
                        "Session {} queue over capacity, keeping {} anyway",
                        self.id,
                        msg.body.kind()
                    );
                    queue.push_back(msg);
                    Enqueue::Queued
                }
            };
            self.notify.notify_one();

            if streak >= OVERFLOW_DISCONNECT_STREAK {
                return Enqueue::Disconnect;
            }
            return outcome;
        }

        self.overflow_streak.store(0, Ordering::Relaxed);
        queue.push_back(msg);
        drop(queue);
        self.notify.notify_one();
        Enqueue::Queued
    }

    /// Await the next queued message, FIFO.
    pub async fn next_message(&self) -> SyncMessage {
        loop {
            if let Some(msg) = self.queue.lock().pop_front() {
                return msg;
            }
            self.notify.notified().await;
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Record inbound activity from the peer.
    pub fn touch(&self) {
        self.last_activity
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn idle_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() - self.last_activity.load(Ordering::Relaxed)
    }

    /// Signal the session's tasks to stop.
    pub fn close(&self) {
        let _ = self.close_tx.send(true);
        self.notify.notify_one();
    }

    pub fn closed(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            client_id: self.id.clone(),
            remote_address: self.remote.to_string(),
            connected_at: self.connected_at,
            last_activity: self.last_activity.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obs::types::TransformPatch;
    use crate::protocol::{
        MessageBody, SceneChangePayload, SyncTargetType, TransformUpdatePayload,
    };

    fn test_session() -> Session {
        Session::new("abc123".to_string(), "127.0.0.1:9000".parse().unwrap())
    }

    fn transform_msg(scene: &str, item_id: i64, x: f64) -> SyncMessage {
        SyncMessage::new(
            SyncTargetType::Source,
            MessageBody::TransformUpdate(TransformUpdatePayload {
                scene_name: scene.to_string(),
                scene_item_id: item_id,
                source_name: "Cam".to_string(),
                transform: TransformPatch {
                    position_x: Some(x),
                    ..Default::default()
                },
            }),
        )
    }

    fn scene_msg(name: &str) -> SyncMessage {
        SyncMessage::new(
            SyncTargetType::Program,
            MessageBody::SceneChange(SceneChangePayload {
                scene_name: name.to_string(),
            }),
        )
    }

    #[test]
    fn coalescing_keeps_slot_and_newest_payload() {
        let session = test_session();

        assert_eq!(session.enqueue(transform_msg("Main", 3, 1.0)), Enqueue::Queued);
        assert_eq!(session.enqueue(scene_msg("Main")), Enqueue::Queued);
        assert_eq!(
            session.enqueue(transform_msg("Main", 3, 2.0)),
            Enqueue::Coalesced
        );
        assert_eq!(
            session.enqueue(transform_msg("Main", 3, 3.0)),
            Enqueue::Coalesced
        );
        // Different item does not coalesce.
        assert_eq!(session.enqueue(transform_msg("Main", 4, 9.0)), Enqueue::Queued);

        assert_eq!(session.queue_len(), 3);

        let queue = session.queue.lock();
        match &queue[0].body {
            MessageBody::TransformUpdate(p) => {
                assert_eq!(p.scene_item_id, 3);
                assert_eq!(p.transform.position_x, Some(3.0));
            }
            other => panic!("expected transform first, got {:?}", other.kind()),
        }
        assert!(matches!(queue[1].body, MessageBody::SceneChange(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn messages_drain_in_fifo_order() {
        let session = test_session();
        session.enqueue(scene_msg("One"));
        session.enqueue(transform_msg("Main", 1, 5.0));
        session.enqueue(scene_msg("Two"));

        let kinds = [
            session.next_message().await.body.kind(),
            session.next_message().await.body.kind(),
            session.next_message().await.body.kind(),
        ];
        assert_eq!(kinds, ["scene_change", "transform_update", "scene_change"]);
    }

    #[test]
    fn overflow_sheds_oldest_transform_first() {
        let session = test_session();
        for i in 0..QUEUE_CAPACITY {
            // Distinct item ids so nothing coalesces.
            session.enqueue(transform_msg("Main", i as i64, 0.0));
        }
        assert_eq!(session.queue_len(), QUEUE_CAPACITY);

        assert_eq!(session.enqueue(scene_msg("Late")), Enqueue::Dropped);
        assert_eq!(session.queue_len(), QUEUE_CAPACITY);

        // The oldest transform (item 0) is gone; item 1 is now first.
        let queue = session.queue.lock();
        match &queue[0].body {
            MessageBody::TransformUpdate(p) => assert_eq!(p.scene_item_id, 1),
            other => panic!("unexpected head {:?}", other.kind()),
        }
        assert!(matches!(
            queue[QUEUE_CAPACITY - 1].body,
            MessageBody::SceneChange(_)
        ));
    }

    #[test]
    fn overflow_never_drops_scene_changes() {
        let session = test_session();
        for i in 0..QUEUE_CAPACITY {
            session.enqueue(scene_msg(&format!("Scene {}", i)));
        }

        // Nothing coalescable queued and the incoming message must be
        // delivered too: the queue runs over capacity instead of losing it.
        assert_eq!(session.enqueue(scene_msg("Overflow")), Enqueue::Queued);
        assert_eq!(session.queue_len(), QUEUE_CAPACITY + 1);

        let queue = session.queue.lock();
        match &queue[0].body {
            MessageBody::SceneChange(p) => assert_eq!(p.scene_name, "Scene 0"),
            other => panic!("unexpected head {:?}", other.kind()),
        }
        match &queue[QUEUE_CAPACITY].body {
            MessageBody::SceneChange(p) => assert_eq!(p.scene_name, "Overflow"),
            other => panic!("unexpected tail {:?}", other.kind()),
        }
    }

    #[test]
    fn overflow_sheds_incoming_transform_when_nothing_else_is_sheddable() {
        let session = test_session();
        for i in 0..QUEUE_CAPACITY {
            session.enqueue(scene_msg(&format!("Scene {}", i)));
        }

        assert_eq!(
            session.enqueue(transform_msg("Main", 1, 5.0)),
            Enqueue::Dropped
        );
        assert_eq!(session.queue_len(), QUEUE_CAPACITY);
        assert!(session
            .queue
            .lock()
            .iter()
            .all(|m| matches!(m.body, MessageBody::SceneChange(_))));
    }

    #[test]
    fn sustained_overflow_requests_disconnect() {
        let session = test_session();
        for i in 0..QUEUE_CAPACITY {
            session.enqueue(transform_msg("Main", i as i64, 0.0));
        }

        let mut last = Enqueue::Queued;
        for _ in 0..OVERFLOW_DISCONNECT_STREAK {
            last = session.enqueue(scene_msg("Spam"));
        }
        assert_eq!(last, Enqueue::Disconnect);
    }

    #[test]
    fn successful_enqueue_resets_overflow_streak() {
        let session = test_session();
        for i in 0..QUEUE_CAPACITY {
            session.enqueue(transform_msg("Main", i as i64, 0.0));
        }
        assert_eq!(session.enqueue(scene_msg("Spam")), Enqueue::Dropped);

        // Drain some room, then a clean enqueue clears the streak.
        session.queue.lock().pop_front();
        assert_eq!(session.enqueue(scene_msg("Calm")), Enqueue::Queued);
        assert_eq!(session.overflow_streak.load(Ordering::Relaxed), 0);
    }
}
