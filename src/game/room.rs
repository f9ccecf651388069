//! Room State Machine
//!
//! The `Room` is the authoritative aggregate for one two-player match:
//! confirmation handshake, synchronized play, and terminal settlement
//! state all live here. Every transition is linearized through the
//! room's own lock; clients are dumb readers that reconcile against
//! the snapshot.
//!
//! Lifecycle: `Confirming -> Playing -> Finished`, with `Cancelled` as
//! the discarded branch when the confirmation window lapses. No
//! transition skips a state and a room never re-enters an earlier one.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::clock::BattleClock;
use crate::core::ids::{RoomId, UserId};
use crate::game::settlement::SettlementState;
use crate::ledger::Credits;
use crate::questions::Question;

/// Questions per match.
pub const DEFAULT_QUESTION_COUNT: usize = 25;
/// Base match duration in seconds.
pub const DEFAULT_MATCH_DURATION_SECS: i64 = 300;
/// Seconds both players have to confirm after pairing.
pub const DEFAULT_CONFIRM_WINDOW_SECS: i64 = 30;
/// Seconds per round before silent players are recorded as no-answer.
pub const DEFAULT_ROUND_TIME_SECS: i64 = 30;
/// Bonus seconds added to the remaining total per correct answer.
pub const DEFAULT_CORRECT_BONUS_SECS: i64 = 3;

/// Tunable match parameters, fixed at room creation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MatchRules {
    /// Number of questions fetched per match.
    pub question_count: usize,
    /// Confirmation window length (seconds).
    pub confirm_window_secs: i64,
    /// Per-round answer deadline (seconds).
    pub round_time_secs: i64,
    /// Base match duration (seconds).
    pub match_duration_secs: i64,
    /// Bonus seconds per correct answer, applied to the total clock.
    pub correct_bonus_secs: i64,
}

impl Default for MatchRules {
    fn default() -> Self {
        Self {
            question_count: DEFAULT_QUESTION_COUNT,
            confirm_window_secs: DEFAULT_CONFIRM_WINDOW_SECS,
            round_time_secs: DEFAULT_ROUND_TIME_SECS,
            match_duration_secs: DEFAULT_MATCH_DURATION_SECS,
            correct_bonus_secs: DEFAULT_CORRECT_BONUS_SECS,
        }
    }
}

/// Participant role within a room.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// First-queued player.
    Primary,
    /// Second-queued player.
    Secondary,
}

/// One of the room's two participants.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Participant {
    /// Participant identity.
    pub user_id: UserId,
    /// Role assigned at pairing.
    pub role: Role,
    /// Battle character chosen at enqueue time.
    pub character: u8,
    /// When this participant confirmed, if they have.
    pub confirmed_at: Option<DateTime<Utc>>,
}

/// Room lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    /// Waiting for both confirmations.
    Confirming,
    /// Match in progress.
    Playing,
    /// Match over; settlement may still be reconciling.
    Finished,
    /// Confirmation window lapsed; room is discarded, no stakes moved.
    Cancelled,
}

/// Result of a confirmation submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationStatus {
    /// The submitting participant has confirmed.
    pub self_confirmed: bool,
    /// The other participant has confirmed.
    pub peer_confirmed: bool,
}

/// Append-only record of one answer submission. Never mutated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerRecord {
    /// Room the answer belongs to.
    pub room_id: RoomId,
    /// Round the answer was submitted for.
    pub round_index: usize,
    /// Submitting participant.
    pub user_id: UserId,
    /// Chosen option index; `None` is the no-answer sentinel recorded
    /// on round timeout.
    pub selected_option: Option<u8>,
    /// Whether the selection matched the frozen answer key.
    pub correct: bool,
    /// Submission instant (server time).
    pub submitted_at: DateTime<Utc>,
}

/// Room errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    /// No live room with that ID.
    #[error("room not found")]
    RoomNotFound,

    /// Action attempted in the wrong lifecycle state.
    #[error("invalid state: room is {actual:?}")]
    InvalidState {
        /// State the room was actually in.
        actual: RoomStatus,
    },

    /// Answer submitted for a round that already advanced.
    #[error("stale round: submitted {submitted}, current {current}")]
    StaleRound {
        /// Round index the caller submitted for.
        submitted: usize,
        /// Round index the room is actually on.
        current: usize,
    },

    /// Caller is not one of the room's two participants.
    #[error("not a participant of this room")]
    NotParticipant,

    /// Room creation requires two distinct participants.
    #[error("participants must be two distinct users")]
    InvalidParticipants,

    /// Room creation requires a non-empty question sequence.
    #[error("question sequence is empty")]
    EmptyQuestions,
}

/// The authoritative match aggregate.
#[derive(Clone, Debug)]
pub struct Room {
    /// Unique room identifier.
    pub id: RoomId,
    /// Rules frozen at creation.
    pub rules: MatchRules,
    /// Stake tier both players entered at.
    pub stake: Credits,
    /// Exactly two participants; index 0 is primary.
    pub participants: [Participant; 2],
    /// Lifecycle state.
    pub status: RoomStatus,
    /// Ordered, immutable question sequence fixed at creation.
    pub questions: Vec<Question>,
    /// Shared question pointer. Monotonically non-decreasing.
    pub current_round: usize,
    /// Scores by participant index.
    pub scores: [u32; 2],
    /// Append-only answer log.
    pub answers: Vec<AnswerRecord>,
    /// When the room was created (confirmation window epoch).
    pub created_at: DateTime<Utc>,
    /// Battle clock; present once the match starts.
    pub clock: Option<BattleClock>,
    /// When the current round opened; drives the per-round deadline.
    pub round_opened_at: Option<DateTime<Utc>>,
    /// Winner; set exactly once at finalize. `None` before finish and
    /// on draws (disambiguated by `status`).
    pub winner_id: Option<UserId>,
    /// When the room finished.
    pub finished_at: Option<DateTime<Utc>>,
    /// Exactly-once settlement guard and result.
    pub settlement: SettlementState,
}

impl Room {
    /// Create a room for two paired players.
    ///
    /// Fails when the participants are not distinct or the question
    /// sequence is empty; a room must never exist half-formed.
    pub fn new(
        id: RoomId,
        primary: (UserId, u8),
        secondary: (UserId, u8),
        questions: Vec<Question>,
        stake: Credits,
        rules: MatchRules,
    ) -> Result<Self, RoomError> {
        if primary.0 == secondary.0 {
            return Err(RoomError::InvalidParticipants);
        }
        if questions.is_empty() {
            return Err(RoomError::EmptyQuestions);
        }

        Ok(Self {
            id,
            rules,
            stake,
            participants: [
                Participant {
                    user_id: primary.0,
                    role: Role::Primary,
                    character: primary.1,
                    confirmed_at: None,
                },
                Participant {
                    user_id: secondary.0,
                    role: Role::Secondary,
                    character: secondary.1,
                    confirmed_at: None,
                },
            ],
            status: RoomStatus::Confirming,
            questions,
            current_round: 0,
            scores: [0, 0],
            answers: Vec::new(),
            created_at: Utc::now(),
            clock: None,
            round_opened_at: None,
            winner_id: None,
            finished_at: None,
            settlement: SettlementState::Pending,
        })
    }

    /// Index (0 or 1) of a participant, if they belong to this room.
    pub fn participant_index(&self, user_id: UserId) -> Option<usize> {
        self.participants
            .iter()
            .position(|p| p.user_id == user_id)
    }

    /// The other participant's index.
    pub fn peer_index(index: usize) -> usize {
        1 - index
    }

    /// Submit a confirmation.
    ///
    /// Idempotent: confirming twice is a no-op, not an error. The
    /// writer that observes the second confirmation stamps `started_at`
    /// (the clock) exactly once and moves the room to `Playing`;
    /// late or repeated confirmers simply read the already-set state.
    pub fn confirm(&mut self, user_id: UserId, now: DateTime<Utc>) -> Result<ConfirmationStatus, RoomError> {
        let index = self
            .participant_index(user_id)
            .ok_or(RoomError::NotParticipant)?;

        match self.status {
            RoomStatus::Confirming => {
                if self.participants[index].confirmed_at.is_none() {
                    self.participants[index].confirmed_at = Some(now);
                }
                let peer = Self::peer_index(index);
                let peer_confirmed = self.participants[peer].confirmed_at.is_some();

                if peer_confirmed && self.clock.is_none() {
                    // Second confirmation observed: single authoritative
                    // start instant, set exactly once.
                    self.clock = Some(BattleClock::start(now, self.rules.match_duration_secs));
                    self.round_opened_at = Some(now);
                    self.status = RoomStatus::Playing;
                }

                Ok(ConfirmationStatus {
                    self_confirmed: true,
                    peer_confirmed,
                })
            }
            // A racer that lost the transition still gets a truthful read.
            RoomStatus::Playing => Ok(ConfirmationStatus {
                self_confirmed: true,
                peer_confirmed: true,
            }),
            actual => Err(RoomError::InvalidState { actual }),
        }
    }

    /// Whether the confirmation window has lapsed without a start.
    pub fn confirm_window_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == RoomStatus::Confirming
            && now - self.created_at > Duration::seconds(self.rules.confirm_window_secs)
    }

    /// Cancel a room that never started. Returns whether this call
    /// performed the transition.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != RoomStatus::Confirming {
            return false;
        }
        self.status = RoomStatus::Cancelled;
        self.finished_at = Some(now);
        true
    }

    /// Transition `Playing -> Finished` and determine the winner.
    ///
    /// Idempotent: repeated calls (from the round synchronizer, the
    /// battle clock, or a client-triggered check) after the first are
    /// no-ops. Returns whether this call performed the transition.
    pub fn finalize(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != RoomStatus::Playing {
            return false;
        }
        self.status = RoomStatus::Finished;
        self.finished_at = Some(now);
        self.winner_id = match self.scores[0].cmp(&self.scores[1]) {
            std::cmp::Ordering::Greater => Some(self.participants[0].user_id),
            std::cmp::Ordering::Less => Some(self.participants[1].user_id),
            std::cmp::Ordering::Equal => None,
        };
        true
    }

    /// When the match started, if it has.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.clock.map(|c| c.started_at)
    }

    /// Remaining match time at `now`. `None` before the match starts.
    pub fn remaining_time(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.clock.map(|c| c.remaining(now))
    }

    /// Whether the room is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, RoomStatus::Finished | RoomStatus::Cancelled)
    }

    /// Build the reconciliation snapshot.
    ///
    /// Answer keys are only revealed for rounds the match has already
    /// advanced past; a reconnecting client cannot read ahead.
    pub fn snapshot(&self, now: DateTime<Utc>) -> RoomSnapshot {
        RoomSnapshot {
            id: self.id,
            status: self.status,
            participants: self
                .participants
                .iter()
                .map(|p| ParticipantView {
                    user_id: p.user_id,
                    role: p.role,
                    character: p.character,
                    confirmed: p.confirmed_at.is_some(),
                })
                .collect(),
            stake: self.stake,
            question_count: self.questions.len(),
            questions: self
                .questions
                .iter()
                .enumerate()
                .map(|(i, q)| QuestionView {
                    id: q.id.clone(),
                    prompt: q.prompt.clone(),
                    options: q.options.clone(),
                    correct_option: if i < self.current_round {
                        Some(q.correct_option)
                    } else {
                        None
                    },
                })
                .collect(),
            current_round: self.current_round,
            scores: self.scores,
            started_at: self.started_at(),
            finished_at: self.finished_at,
            remaining_secs: self.remaining_time(now).map(|d| d.num_seconds()),
            winner_id: self.winner_id,
            settlement_complete: matches!(self.settlement, SettlementState::Complete(_)),
        }
    }
}

/// Participant fields exposed in snapshots.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParticipantView {
    /// Participant identity.
    pub user_id: UserId,
    /// Assigned role.
    pub role: Role,
    /// Chosen character.
    pub character: u8,
    /// Whether this participant has confirmed.
    pub confirmed: bool,
}

/// Question fields exposed in snapshots. The answer key is withheld
/// until the round has advanced past the question.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuestionView {
    /// Source question identifier.
    pub id: String,
    /// Question text.
    pub prompt: String,
    /// Answer options.
    pub options: [String; crate::questions::OPTION_COUNT],
    /// Answer key, revealed only for completed rounds.
    pub correct_option: Option<u8>,
}

/// Authoritative room state for client reconciliation.
///
/// A pure read of the room record; no event replay is needed to
/// reconstruct it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomSnapshot {
    /// Room identifier.
    pub id: RoomId,
    /// Lifecycle state.
    pub status: RoomStatus,
    /// Both participants.
    pub participants: Vec<ParticipantView>,
    /// Stake tier.
    pub stake: Credits,
    /// Total rounds in the match.
    pub question_count: usize,
    /// Question sequence (keys withheld for unplayed rounds).
    pub questions: Vec<QuestionView>,
    /// Shared question pointer.
    pub current_round: usize,
    /// Scores, primary first.
    pub scores: [u32; 2],
    /// Authoritative start instant.
    pub started_at: Option<DateTime<Utc>>,
    /// When the room reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Seconds left on the battle clock at snapshot time.
    pub remaining_secs: Option<i64>,
    /// Winner (`None` = draw or not finished).
    pub winner_id: Option<UserId>,
    /// Whether stake transfers have fully reconciled.
    pub settlement_complete: bool,
}

// =============================================================================
// ROOM MANAGER
// =============================================================================

/// Registry of live rooms.
///
/// Each room is its own unit of concurrency behind `Arc<RwLock<_>>`;
/// the manager only guards the lookup tables, never a cross-room lock.
pub struct RoomManager {
    rooms: RwLock<BTreeMap<RoomId, Arc<RwLock<Room>>>>,
    user_rooms: RwLock<BTreeMap<UserId, RoomId>>,
}

impl RoomManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(BTreeMap::new()),
            user_rooms: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a freshly created room and index its participants.
    pub async fn insert(&self, room: Room) -> Arc<RwLock<Room>> {
        let id = room.id;
        let users: Vec<UserId> = room.participants.iter().map(|p| p.user_id).collect();
        let handle = Arc::new(RwLock::new(room));

        self.rooms.write().await.insert(id, handle.clone());
        let mut user_rooms = self.user_rooms.write().await;
        for user in users {
            user_rooms.insert(user, id);
        }
        handle
    }

    /// Look up a room by ID.
    pub async fn get(&self, id: RoomId) -> Option<Arc<RwLock<Room>>> {
        self.rooms.read().await.get(&id).cloned()
    }

    /// Look up the room a user currently belongs to.
    pub async fn get_user_room(&self, user_id: UserId) -> Option<Arc<RwLock<Room>>> {
        let room_id = { self.user_rooms.read().await.get(&user_id).copied() };
        match room_id {
            Some(id) => self.get(id).await,
            None => None,
        }
    }

    /// Whether a user is currently bound to a live room.
    pub async fn user_in_room(&self, user_id: UserId) -> bool {
        self.user_rooms.read().await.contains_key(&user_id)
    }

    /// Reconciliation read: the authoritative snapshot for a room.
    pub async fn snapshot(&self, id: RoomId) -> Result<RoomSnapshot, RoomError> {
        let room = self.get(id).await.ok_or(RoomError::RoomNotFound)?;
        let room = room.read().await;
        Ok(room.snapshot(Utc::now()))
    }

    /// Unbind a room's participants so they can matchmake again.
    ///
    /// Called as soon as the room reaches a terminal state; the room
    /// itself stays registered for late snapshot reads until retired.
    pub async fn release_users(&self, id: RoomId) {
        let room = match self.get(id).await {
            Some(room) => room,
            None => return,
        };
        let room = room.read().await;
        let mut user_rooms = self.user_rooms.write().await;
        for p in &room.participants {
            // Only unbind if still pointing at this room.
            if user_rooms.get(&p.user_id) == Some(&id) {
                user_rooms.remove(&p.user_id);
            }
        }
    }

    /// Remove a room and free its participants.
    pub async fn retire(&self, id: RoomId) {
        let removed = self.rooms.write().await.remove(&id);
        if let Some(room) = removed {
            let room = room.read().await;
            let mut user_rooms = self.user_rooms.write().await;
            for p in &room.participants {
                // Only unbind if still pointing at this room.
                if user_rooms.get(&p.user_id) == Some(&id) {
                    user_rooms.remove(&p.user_id);
                }
            }
        }
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Drop rooms that reached a terminal state.
    pub async fn cleanup(&self) {
        let terminal: Vec<RoomId> = {
            let rooms = self.rooms.read().await;
            let mut ids = Vec::new();
            for (id, room) in rooms.iter() {
                if room.read().await.is_terminal() {
                    ids.push(*id);
                }
            }
            ids
        };
        for id in terminal {
            self.retire(id).await;
        }
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}
