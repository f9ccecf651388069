//! Matchmaking Queue
//!
//! Holds waiting players until two with the same stake tier can be
//! paired. Pairing is globally serialized through one lock so an entry
//! can never be consumed by two rooms, no matter how many callers poll
//! `try_match` concurrently.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ids::UserId;
use crate::ledger::Credits;

/// Default maximum time an entry may sit in the queue before being
/// evicted (seconds).
pub const DEFAULT_MAX_QUEUE_AGE_SECS: i64 = 120;

/// A waiting player's matchmaking request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Waiting user.
    pub user_id: UserId,
    /// Stake tier; only equal stakes are paired.
    pub stake: Credits,
    /// Chosen battle character, carried into the room.
    pub character: u8,
    /// When the entry was created. FIFO tiebreaker.
    pub enqueued_at: DateTime<Utc>,
}

/// Two compatible entries removed from the queue together.
#[derive(Clone, Debug)]
pub struct MatchPair {
    /// Earlier-queued entry; becomes the primary participant.
    pub first: QueueEntry,
    /// Later-queued entry; becomes the secondary participant.
    pub second: QueueEntry,
}

/// Queue errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// User already has a live queue entry.
    #[error("already queued")]
    AlreadyQueued,

    /// User has no queue entry to remove.
    #[error("not queued")]
    NotQueued,
}

/// The shared matchmaking queue.
///
/// A single mutex guards the entry list; every mutation (enqueue,
/// dequeue, pairing, expiry sweep) happens under it, which is what
/// makes pairing atomic: both entries leave the queue in one critical
/// section or neither does.
pub struct MatchQueue {
    entries: Mutex<Vec<QueueEntry>>,
    max_age: Duration,
}

impl MatchQueue {
    /// Create a queue with the default entry lifetime.
    pub fn new() -> Self {
        Self::with_max_age(Duration::seconds(DEFAULT_MAX_QUEUE_AGE_SECS))
    }

    /// Create a queue with a custom entry lifetime.
    pub fn with_max_age(max_age: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            max_age,
        }
    }

    /// Add a user to the queue.
    pub fn enqueue(
        &self,
        user_id: UserId,
        stake: Credits,
        character: u8,
    ) -> Result<QueueEntry, QueueError> {
        let mut entries = self.entries.lock().expect("queue lock poisoned");
        if entries.iter().any(|e| e.user_id == user_id) {
            return Err(QueueError::AlreadyQueued);
        }
        let entry = QueueEntry {
            user_id,
            stake,
            character,
            enqueued_at: Utc::now(),
        };
        entries.push(entry.clone());
        Ok(entry)
    }

    /// Remove a user's entry.
    pub fn dequeue(&self, user_id: UserId) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().expect("queue lock poisoned");
        let before = entries.len();
        entries.retain(|e| e.user_id != user_id);
        if entries.len() == before {
            return Err(QueueError::NotQueued);
        }
        Ok(())
    }

    /// Attempt to pair two compatible entries.
    ///
    /// FIFO within a stake tier: the oldest entry is matched with the
    /// oldest later entry carrying the same stake. Both are removed
    /// atomically; returns `None` when no pair exists.
    ///
    /// Expiry is not checked here. Stale entries leave only through
    /// `sweep_expired`, which reports them so the evicted users get
    /// notified.
    pub fn try_match(&self) -> Option<MatchPair> {
        let mut entries = self.entries.lock().expect("queue lock poisoned");

        for i in 0..entries.len() {
            let stake = entries[i].stake;
            if let Some(j) = entries
                .iter()
                .enumerate()
                .skip(i + 1)
                .find(|(_, e)| e.stake == stake)
                .map(|(j, _)| j)
            {
                // Remove the later index first so the earlier one stays valid.
                let second = entries.remove(j);
                let first = entries.remove(i);
                return Some(MatchPair { first, second });
            }
        }
        None
    }

    /// Return a pair to the front of the queue.
    ///
    /// Used when room creation fails after pairing (e.g. the question
    /// source came up short); neither player loses their place.
    pub fn requeue(&self, pair: MatchPair) {
        let mut entries = self.entries.lock().expect("queue lock poisoned");
        entries.insert(0, pair.second);
        entries.insert(0, pair.first);
    }

    /// Evict entries older than the configured lifetime.
    /// Returns the evicted users so callers can notify them.
    pub fn sweep_expired(&self) -> Vec<UserId> {
        let mut entries = self.entries.lock().expect("queue lock poisoned");
        let now = Utc::now();
        let (expired, kept): (Vec<_>, Vec<_>) = entries
            .drain(..)
            .partition(|e| now - e.enqueued_at > self.max_age);
        *entries = kept;
        expired.into_iter().map(|e| e.user_id).collect()
    }

    /// Whether a user currently has a queue entry.
    pub fn contains(&self, user_id: UserId) -> bool {
        let entries = self.entries.lock().expect("queue lock poisoned");
        entries.iter().any(|e| e.user_id == user_id)
    }

    /// Current queue length.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("queue lock poisoned").len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn user(b: u8) -> UserId {
        UserId::new([b; 16])
    }

    #[test]
    fn test_enqueue_dequeue() {
        let queue = MatchQueue::new();
        queue.enqueue(user(1), 70, 0).unwrap();
        assert!(queue.contains(user(1)));

        queue.dequeue(user(1)).unwrap();
        assert!(!queue.contains(user(1)));
    }

    #[test]
    fn test_already_queued_rejected() {
        let queue = MatchQueue::new();
        queue.enqueue(user(1), 70, 0).unwrap();
        let err = queue.enqueue(user(1), 70, 0).unwrap_err();
        assert_eq!(err, QueueError::AlreadyQueued);
    }

    #[test]
    fn test_dequeue_not_queued() {
        let queue = MatchQueue::new();
        let err = queue.dequeue(user(1)).unwrap_err();
        assert_eq!(err, QueueError::NotQueued);
    }

    #[test]
    fn test_fifo_pairing_same_tier() {
        let queue = MatchQueue::new();
        queue.enqueue(user(1), 70, 0).unwrap();
        queue.enqueue(user(2), 70, 1).unwrap();
        queue.enqueue(user(3), 70, 2).unwrap();

        let pair = queue.try_match().unwrap();
        assert_eq!(pair.first.user_id, user(1));
        assert_eq!(pair.second.user_id, user(2));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_stake_tiers_never_mix() {
        let queue = MatchQueue::new();
        queue.enqueue(user(1), 70, 0).unwrap();
        queue.enqueue(user(2), 140, 0).unwrap();

        assert!(queue.try_match().is_none());

        // A third player at the higher tier pairs with the waiting one.
        queue.enqueue(user(3), 140, 0).unwrap();
        let pair = queue.try_match().unwrap();
        assert_eq!(pair.first.user_id, user(2));
        assert_eq!(pair.second.user_id, user(3));
    }

    #[test]
    fn test_requeue_restores_front() {
        let queue = MatchQueue::new();
        queue.enqueue(user(1), 70, 0).unwrap();
        queue.enqueue(user(2), 70, 0).unwrap();
        queue.enqueue(user(3), 70, 0).unwrap();

        let pair = queue.try_match().unwrap();
        queue.requeue(pair);

        // The original pair is matched again before the third player.
        let pair = queue.try_match().unwrap();
        assert_eq!(pair.first.user_id, user(1));
        assert_eq!(pair.second.user_id, user(2));
    }

    #[test]
    fn test_sweep_expired() {
        let queue = MatchQueue::with_max_age(Duration::seconds(0));
        queue.enqueue(user(1), 70, 0).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        let evicted = queue.sweep_expired();
        assert_eq!(evicted, vec![user(1)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_stale_entries_leave_only_through_sweep() {
        let queue = MatchQueue::with_max_age(Duration::seconds(0));
        queue.enqueue(user(1), 70, 0).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        // Pairing never drops a stale entry behind the user's back.
        assert!(queue.try_match().is_none());
        assert!(queue.contains(user(1)));

        // Eviction happens in the sweep, which reports who left.
        assert_eq!(queue.sweep_expired(), vec![user(1)]);
    }

    #[test]
    fn test_no_double_pairing_under_concurrency() {
        let queue = Arc::new(MatchQueue::new());
        for i in 0..100u8 {
            queue.enqueue(user(i), 70, 0).unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            handles.push(std::thread::spawn(move || {
                let mut pairs = Vec::new();
                while let Some(pair) = queue.try_match() {
                    pairs.push(pair);
                }
                pairs
            }));
        }

        let mut seen = std::collections::BTreeSet::new();
        let mut total = 0;
        for handle in handles {
            for pair in handle.join().unwrap() {
                total += 1;
                // No entry may appear in two pairs.
                assert!(seen.insert(pair.first.user_id));
                assert!(seen.insert(pair.second.user_id));
            }
        }
        assert_eq!(total, 50);
        assert!(queue.is_empty());
    }

    proptest::proptest! {
        // Any mix of stake tiers: every produced pair shares a stake,
        // no user is consumed twice, and nothing goes missing.
        #[test]
        fn prop_pairing_conserves_entries(stakes in proptest::collection::vec(1u64..5, 0..40usize)) {
            let queue = MatchQueue::new();
            for (i, stake) in stakes.iter().enumerate() {
                queue.enqueue(user(i as u8), *stake * 10, 0).unwrap();
            }

            let mut seen = std::collections::BTreeSet::new();
            let mut pairs = 0;
            while let Some(pair) = queue.try_match() {
                proptest::prop_assert_eq!(pair.first.stake, pair.second.stake);
                proptest::prop_assert!(pair.first.enqueued_at <= pair.second.enqueued_at);
                proptest::prop_assert!(seen.insert(pair.first.user_id));
                proptest::prop_assert!(seen.insert(pair.second.user_id));
                pairs += 1;
            }
            proptest::prop_assert_eq!(pairs * 2 + queue.len(), stakes.len());
        }
    }
}
