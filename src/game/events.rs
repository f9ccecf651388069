//! Room Events
//!
//! Typed state-change notifications fanned out to both participants'
//! connections. Subscriptions are explicit per-room lists; there is no
//! ambient broadcast bus. Events exist for responsiveness only — the
//! room snapshot is the source of truth, and a client that missed
//! events reconciles with a snapshot read instead of replay.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::core::ids::{RoomId, UserId};

/// State-change notification for one room.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RoomEvent {
    /// Two players were paired into a new room.
    RoomCreated {
        /// New room.
        room_id: RoomId,
        /// Both participants, primary first.
        participants: [UserId; 2],
        /// Stake tier.
        stake: crate::ledger::Credits,
        /// Seconds to confirm before the room is cancelled.
        confirm_window_secs: i64,
    },

    /// A participant confirmed.
    ConfirmationUpdate {
        /// Room concerned.
        room_id: RoomId,
        /// Who confirmed.
        user_id: UserId,
        /// Whether both confirmations are now present.
        all_confirmed: bool,
    },

    /// Both confirmed; the match is running.
    MatchStarted {
        /// Room concerned.
        room_id: RoomId,
        /// The single authoritative start instant.
        started_at: DateTime<Utc>,
    },

    /// The shared question pointer advanced.
    RoundAdvanced {
        /// Room concerned.
        room_id: RoomId,
        /// Index of the round that just completed. Always within the
        /// question list; after the last round this event carries the
        /// final index and `MatchFinished` follows.
        index: usize,
        /// Answer key of the round that just completed.
        correct_answer: u8,
        /// Scores after the round, primary first.
        scores: [u32; 2],
    },

    /// The match finished.
    MatchFinished {
        /// Room concerned.
        room_id: RoomId,
        /// Winner (`None` = draw).
        winner_id: Option<UserId>,
        /// Final scores, primary first.
        final_scores: [u32; 2],
    },

    /// Confirmation window lapsed; the room was discarded.
    RoomCancelled {
        /// Room concerned.
        room_id: RoomId,
    },
}

struct Subscriber {
    user_id: UserId,
    sender: mpsc::Sender<RoomEvent>,
}

/// Fan-out of room events to participant connections.
pub struct RoomBroadcaster {
    subscribers: RwLock<BTreeMap<RoomId, Vec<Subscriber>>>,
}

impl RoomBroadcaster {
    /// Create an empty broadcaster.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Attach a participant connection to a room's subscriber list.
    /// Re-subscribing replaces the previous sender (reconnects).
    pub async fn subscribe(&self, room_id: RoomId, user_id: UserId, sender: mpsc::Sender<RoomEvent>) {
        let mut subs = self.subscribers.write().await;
        let list = subs.entry(room_id).or_default();
        list.retain(|s| s.user_id != user_id);
        list.push(Subscriber { user_id, sender });
    }

    /// Detach a participant from a room.
    pub async fn unsubscribe(&self, room_id: RoomId, user_id: UserId) {
        let mut subs = self.subscribers.write().await;
        if let Some(list) = subs.get_mut(&room_id) {
            list.retain(|s| s.user_id != user_id);
            if list.is_empty() {
                subs.remove(&room_id);
            }
        }
    }

    /// Push an event to every live subscriber of a room.
    ///
    /// The subscriber table is never held across channel sends, so one
    /// room's slow connection cannot stall delivery anywhere else. A
    /// closed or full channel marks the subscriber dead and it is
    /// pruned; delivery is best-effort since snapshots carry
    /// correctness and a lagging client recovers by resyncing.
    pub async fn publish(&self, room_id: RoomId, event: RoomEvent) {
        let targets: Vec<(UserId, mpsc::Sender<RoomEvent>)> = {
            let subs = self.subscribers.read().await;
            match subs.get(&room_id) {
                Some(list) => list.iter().map(|s| (s.user_id, s.sender.clone())).collect(),
                None => return,
            }
        };

        let mut dead = Vec::new();
        for (user_id, sender) in &targets {
            // A full channel means the connection stopped draining;
            // treat it like a closed one instead of waiting on it.
            if sender.try_send(event.clone()).is_err() {
                dead.push(*user_id);
            }
        }

        if !dead.is_empty() {
            debug!(room = %room_id.short(), dropped = dead.len(), "pruning dead subscribers");
            let mut subs = self.subscribers.write().await;
            if let Some(list) = subs.get_mut(&room_id) {
                list.retain(|s| !dead.contains(&s.user_id));
            }
        }
    }

    /// Drop a retired room's subscriber list.
    pub async fn remove_room(&self, room_id: RoomId) {
        self.subscribers.write().await.remove(&room_id);
    }

    /// Number of subscribers attached to a room.
    pub async fn subscriber_count(&self, room_id: RoomId) -> usize {
        self.subscribers
            .read()
            .await
            .get(&room_id)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

impl Default for RoomBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(b: u8) -> UserId {
        UserId::new([b; 16])
    }

    #[tokio::test]
    async fn test_publish_reaches_both_participants() {
        let broadcaster = RoomBroadcaster::new();
        let room_id = RoomId::generate();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);

        broadcaster.subscribe(room_id, user(1), tx1).await;
        broadcaster.subscribe(room_id, user(2), tx2).await;

        broadcaster
            .publish(room_id, RoomEvent::RoomCancelled { room_id })
            .await;

        assert!(matches!(rx1.recv().await, Some(RoomEvent::RoomCancelled { .. })));
        assert!(matches!(rx2.recv().await, Some(RoomEvent::RoomCancelled { .. })));
    }

    #[tokio::test]
    async fn test_events_scoped_to_room() {
        let broadcaster = RoomBroadcaster::new();
        let room_a = RoomId::generate();
        let room_b = RoomId::generate();
        let (tx, mut rx) = mpsc::channel(8);

        broadcaster.subscribe(room_b, user(1), tx).await;
        broadcaster
            .publish(room_a, RoomEvent::RoomCancelled { room_id: room_a })
            .await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_subscriber_pruned() {
        let broadcaster = RoomBroadcaster::new();
        let room_id = RoomId::generate();
        let (tx, rx) = mpsc::channel(8);
        drop(rx);

        broadcaster.subscribe(room_id, user(1), tx).await;
        broadcaster
            .publish(room_id, RoomEvent::RoomCancelled { room_id })
            .await;
        assert_eq!(broadcaster.subscriber_count(room_id).await, 0);
    }

    #[tokio::test]
    async fn test_stalled_subscriber_does_not_block_other_rooms() {
        let broadcaster = RoomBroadcaster::new();
        let room_a = RoomId::generate();
        let room_b = RoomId::generate();
        let (tx_a, _rx_a) = mpsc::channel(1);
        let (tx_b, mut rx_b) = mpsc::channel(8);

        broadcaster.subscribe(room_a, user(1), tx_a).await;
        broadcaster.subscribe(room_b, user(2), tx_b).await;

        // Fill room A's channel; its subscriber never drains.
        broadcaster
            .publish(room_a, RoomEvent::RoomCancelled { room_id: room_a })
            .await;
        broadcaster
            .publish(room_a, RoomEvent::RoomCancelled { room_id: room_a })
            .await;

        // Delivery elsewhere is unaffected by the stalled connection.
        tokio::time::timeout(
            std::time::Duration::from_millis(500),
            broadcaster.publish(room_b, RoomEvent::RoomCancelled { room_id: room_b }),
        )
        .await
        .expect("publish must not wait on an unrelated room");
        assert!(rx_b.recv().await.is_some());

        // The stalled subscriber was pruned, not waited on.
        assert_eq!(broadcaster.subscriber_count(room_a).await, 0);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_sender() {
        let broadcaster = RoomBroadcaster::new();
        let room_id = RoomId::generate();
        let (old_tx, mut old_rx) = mpsc::channel(8);
        let (new_tx, mut new_rx) = mpsc::channel(8);

        broadcaster.subscribe(room_id, user(1), old_tx).await;
        broadcaster.subscribe(room_id, user(1), new_tx).await;
        assert_eq!(broadcaster.subscriber_count(room_id).await, 1);

        broadcaster
            .publish(room_id, RoomEvent::RoomCancelled { room_id })
            .await;
        assert!(old_rx.try_recv().is_err());
        assert!(new_rx.recv().await.is_some());
    }
}
