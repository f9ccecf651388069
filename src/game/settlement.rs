//! Settlement Engine
//!
//! Moves stakes between the two accounts exactly once per room.
//! Invoked only after finalize; the room's settlement state acts as
//! the at-most-once guard, and every ledger instruction carries a
//! `(room, user)` idempotency key so crash-replayed attempts cannot
//! double-debit or double-credit.
//!
//! Ledger I/O happens with the room lock released; only the guard
//! transitions touch the lock.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::core::ids::{RoomId, UserId};
use crate::game::room::{Room, RoomStatus};
use crate::ledger::{AccountLedger, Credits, LedgerError};

/// Default winner prize in tenths of a credit (9.5 credits).
pub const DEFAULT_WINNER_PRIZE: Credits = 95;

/// Configurable settlement amounts.
///
/// The reference economics (stake 7, prize 9.5, the difference retained
/// by the platform; draws move nothing) are defaults, not law — the
/// mechanism is what this module guarantees.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SettlementPolicy {
    /// Net credit issued to the winner.
    pub winner_prize: Credits,
}

impl Default for SettlementPolicy {
    fn default() -> Self {
        Self {
            winner_prize: DEFAULT_WINNER_PRIZE,
        }
    }
}

/// Direction of a ledger instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    /// Balance reduced.
    Debit,
    /// Balance increased.
    Credit,
}

/// One applied ledger instruction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transfer {
    /// Affected user.
    pub user_id: UserId,
    /// Debit or credit.
    pub kind: TransferKind,
    /// Amount in tenths of a credit.
    pub amount: Credits,
    /// Key the ledger deduplicates on.
    pub idempotency_key: String,
}

/// Outcome of a completed settlement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SettlementResult {
    /// Settled room.
    pub room_id: RoomId,
    /// Winner (`None` = draw).
    pub winner_id: Option<UserId>,
    /// Ledger instructions applied, in order. Empty on draws.
    pub transfers: Vec<Transfer>,
}

/// Per-room settlement guard.
#[derive(Clone, Debug)]
pub enum SettlementState {
    /// Not yet attempted (or released for retry after an outage).
    Pending,
    /// An attempt holds the guard; concurrent callers back off.
    InFlight,
    /// Done; the stored result is returned to any repeat caller.
    Complete(SettlementResult),
    /// Business-rule failure (insufficient funds). Needs operator
    /// attention; a later explicit retry is allowed.
    Failed(String),
}

/// Settlement errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SettlementError {
    /// Room has not finished; nothing to settle.
    #[error("room not finished: {actual:?}")]
    NotFinished {
        /// State the room was actually in.
        actual: RoomStatus,
    },

    /// Another settlement attempt currently holds the guard.
    #[error("settlement already in progress")]
    InProgress,

    /// Ledger rejected or was unreachable after retries.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

fn idempotency_key(room_id: RoomId, user_id: UserId) -> String {
    format!("{}:{}", room_id.to_uuid_string(), user_id.to_uuid_string())
}

/// Issues exactly-once stake transfers for finished rooms.
pub struct SettlementEngine {
    policy: SettlementPolicy,
    max_attempts: u32,
    backoff_base: Duration,
}

impl SettlementEngine {
    /// Engine with default policy and backoff.
    pub fn new(policy: SettlementPolicy) -> Self {
        Self {
            policy,
            max_attempts: 5,
            backoff_base: Duration::from_millis(200),
        }
    }

    /// Override retry tuning (tests use tight backoffs).
    pub fn with_retry(mut self, max_attempts: u32, backoff_base: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.backoff_base = backoff_base;
        self
    }

    /// Settle a finished room.
    ///
    /// At most one caller performs the transfers; repeats receive the
    /// stored result. On ledger outage the guard is released so a later
    /// retry (same idempotency keys) can complete the payment while the
    /// room stays `Finished` with `settlement_complete = false`.
    pub async fn settle<L: AccountLedger>(
        &self,
        room: &Arc<RwLock<Room>>,
        ledger: &L,
    ) -> Result<SettlementResult, SettlementError> {
        // Acquire the guard and capture everything needed off-lock.
        let (room_id, winner_id, loser_id, stake) = {
            let mut room = room.write().await;
            if room.status != RoomStatus::Finished {
                return Err(SettlementError::NotFinished {
                    actual: room.status,
                });
            }
            match &room.settlement {
                SettlementState::Complete(result) => return Ok(result.clone()),
                SettlementState::InFlight => return Err(SettlementError::InProgress),
                SettlementState::Pending | SettlementState::Failed(_) => {}
            }
            room.settlement = SettlementState::InFlight;

            let winner_id = room.winner_id;
            let loser_id = winner_id.map(|w| {
                let idx = room.participant_index(w).expect("winner is a participant");
                room.participants[Room::peer_index(idx)].user_id
            });
            (room.id, winner_id, loser_id, room.stake)
        };

        let outcome = self
            .apply_transfers(room_id, winner_id, loser_id, stake, ledger)
            .await;

        let mut guard = room.write().await;
        match outcome {
            Ok(result) => {
                info!(
                    room = %room_id.short(),
                    winner = winner_id.map(|w| w.short()).unwrap_or_else(|| "draw".into()),
                    transfers = result.transfers.len(),
                    "settlement complete"
                );
                guard.settlement = SettlementState::Complete(result.clone());
                Ok(result)
            }
            Err(err @ LedgerError::Unavailable(_)) => {
                // Release the guard; the sporting outcome is final and a
                // later retry reuses the same idempotency keys.
                warn!(room = %room_id.short(), error = %err, "ledger unavailable, settlement deferred");
                guard.settlement = SettlementState::Pending;
                Err(err.into())
            }
            Err(err @ LedgerError::InsufficientFunds { .. }) => {
                // Business-rule failure: operator alert path, not an
                // endless retry loop.
                error!(room = %room_id.short(), error = %err, "settlement failed: insufficient funds");
                guard.settlement = SettlementState::Failed(err.to_string());
                Err(err.into())
            }
        }
    }

    async fn apply_transfers<L: AccountLedger>(
        &self,
        room_id: RoomId,
        winner_id: Option<UserId>,
        loser_id: Option<UserId>,
        stake: Credits,
        ledger: &L,
    ) -> Result<SettlementResult, LedgerError> {
        let mut transfers = Vec::new();

        // Draw: no money moves.
        let (winner, loser) = match (winner_id, loser_id) {
            (Some(w), Some(l)) => (w, l),
            _ => {
                return Ok(SettlementResult {
                    room_id,
                    winner_id: None,
                    transfers,
                })
            }
        };

        let loser_key = idempotency_key(room_id, loser);
        self.with_backoff(|| ledger.debit(loser, stake, &loser_key))
            .await?;
        transfers.push(Transfer {
            user_id: loser,
            kind: TransferKind::Debit,
            amount: stake,
            idempotency_key: loser_key,
        });

        let winner_key = idempotency_key(room_id, winner);
        self.with_backoff(|| ledger.credit(winner, self.policy.winner_prize, &winner_key))
            .await?;
        transfers.push(Transfer {
            user_id: winner,
            kind: TransferKind::Credit,
            amount: self.policy.winner_prize,
            idempotency_key: winner_key,
        });

        Ok(SettlementResult {
            room_id,
            winner_id: Some(winner),
            transfers,
        })
    }

    /// Retry an unavailable ledger with exponential backoff.
    /// `InsufficientFunds` is never retried.
    async fn with_backoff<F, Fut>(&self, mut op: F) -> Result<(), LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), LedgerError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(err @ LedgerError::InsufficientFunds { .. }) => return Err(err),
                Err(err @ LedgerError::Unavailable(_)) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(err);
                    }
                    let delay = self.backoff_base * 2u32.saturating_pow(attempt - 1);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl Default for SettlementEngine {
    fn default() -> Self {
        Self::new(SettlementPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::room::tests::{make_room, user};
    use crate::ledger::MemoryLedger;
    use chrono::Utc;

    fn engine() -> SettlementEngine {
        SettlementEngine::default().with_retry(3, Duration::from_millis(1))
    }

    async fn finished_room(scores: [u32; 2]) -> Arc<RwLock<Room>> {
        let mut room = make_room(25);
        let now = Utc::now();
        room.confirm(user(1), now).unwrap();
        room.confirm(user(2), now).unwrap();
        room.scores = scores;
        room.finalize(now);
        Arc::new(RwLock::new(room))
    }

    #[tokio::test]
    async fn test_winner_credited_loser_debited() {
        let room = finished_room([15, 10]).await;
        let ledger = MemoryLedger::new();
        ledger.deposit(user(1), 100).await;
        ledger.deposit(user(2), 100).await;

        let result = engine().settle(&room, &ledger).await.unwrap();
        assert_eq!(result.winner_id, Some(user(1)));
        assert_eq!(result.transfers.len(), 2);
        assert_eq!(ledger.balance(user(1)).await, 195); // +9.5 credits
        assert_eq!(ledger.balance(user(2)).await, 30); // -7 credits
    }

    #[tokio::test]
    async fn test_draw_moves_nothing() {
        let room = finished_room([10, 10]).await;
        let ledger = MemoryLedger::new();
        ledger.deposit(user(1), 100).await;
        ledger.deposit(user(2), 100).await;

        let result = engine().settle(&room, &ledger).await.unwrap();
        assert_eq!(result.winner_id, None);
        assert!(result.transfers.is_empty());
        assert_eq!(ledger.balance(user(1)).await, 100);
        assert_eq!(ledger.balance(user(2)).await, 100);
    }

    #[tokio::test]
    async fn test_repeat_settle_returns_stored_result() {
        let room = finished_room([15, 10]).await;
        let ledger = MemoryLedger::new();
        ledger.deposit(user(1), 100).await;
        ledger.deposit(user(2), 100).await;

        let eng = engine();
        let first = eng.settle(&room, &ledger).await.unwrap();
        let second = eng.settle(&room, &ledger).await.unwrap();
        assert_eq!(first.transfers.len(), second.transfers.len());
        // One net transfer per participant, ever.
        assert_eq!(ledger.applied_key_count().await, 2);
        assert_eq!(ledger.balance(user(1)).await, 195);
        assert_eq!(ledger.balance(user(2)).await, 30);
    }

    #[tokio::test]
    async fn test_concurrent_settles_apply_once() {
        let room = finished_room([15, 10]).await;
        let ledger = Arc::new(MemoryLedger::new());
        ledger.deposit(user(1), 100).await;
        ledger.deposit(user(2), 100).await;

        let eng = Arc::new(engine());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let room = room.clone();
            let ledger = ledger.clone();
            let eng = eng.clone();
            handles.push(tokio::spawn(async move {
                eng.settle(&room, &*ledger).await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }
        // At least one wins; losers get InProgress or the stored result.
        assert!(successes >= 1);
        assert_eq!(ledger.balance(user(1)).await, 195);
        assert_eq!(ledger.balance(user(2)).await, 30);
        assert_eq!(ledger.applied_key_count().await, 2);
    }

    #[tokio::test]
    async fn test_outage_defers_then_retry_completes() {
        let room = finished_room([15, 10]).await;
        let ledger = MemoryLedger::new();
        ledger.deposit(user(1), 100).await;
        ledger.deposit(user(2), 100).await;

        // Fail more times than the engine will retry.
        ledger.fail_next(10).await;
        let eng = engine();
        let err = eng.settle(&room, &ledger).await.unwrap_err();
        assert!(matches!(
            err,
            SettlementError::Ledger(LedgerError::Unavailable(_))
        ));
        // Guard released: the room still reports settlement pending.
        assert!(matches!(
            room.read().await.settlement,
            SettlementState::Pending
        ));

        // Ledger recovers; the retry completes with the same keys.
        let result = eng.settle(&room, &ledger).await.unwrap();
        assert_eq!(result.winner_id, Some(user(1)));
        assert_eq!(ledger.balance(user(1)).await, 195);
        assert_eq!(ledger.balance(user(2)).await, 30);
    }

    #[tokio::test]
    async fn test_insufficient_funds_marks_failed() {
        let room = finished_room([15, 10]).await;
        let ledger = MemoryLedger::new();
        ledger.deposit(user(1), 100).await;
        ledger.deposit(user(2), 10).await; // below the 70 stake

        let err = engine().settle(&room, &ledger).await.unwrap_err();
        assert!(matches!(
            err,
            SettlementError::Ledger(LedgerError::InsufficientFunds { .. })
        ));
        assert!(matches!(
            room.read().await.settlement,
            SettlementState::Failed(_)
        ));
        // Nothing was credited either.
        assert_eq!(ledger.balance(user(1)).await, 100);
    }

    #[tokio::test]
    async fn test_settle_unfinished_room_rejected() {
        let room = Arc::new(RwLock::new(make_room(25)));
        let ledger = MemoryLedger::new();
        let err = engine().settle(&room, &ledger).await.unwrap_err();
        assert!(matches!(err, SettlementError::NotFinished { .. }));
    }
}
