//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! All messages are serialized as JSON for debugging ease,
//! with optional binary (bincode) for flat payloads.

use serde::{Deserialize, Serialize};

use crate::core::ids::{RoomId, UserId};
use crate::game::events::RoomEvent;
use crate::game::queue::QueueError;
use crate::game::room::{RoomError, RoomSnapshot};
use crate::ledger::{Credits, LedgerError};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate with the server.
    Auth(AuthRequest),

    /// Join the matchmaking queue at a stake tier.
    JoinQueue {
        /// Stake in tenths of a credit; only equal stakes pair.
        stake: Credits,
        /// Chosen battle character.
        character: u8,
    },

    /// Leave the matchmaking queue.
    LeaveQueue,

    /// Confirm participation in a freshly created room.
    Confirm {
        /// Room to confirm.
        room_id: RoomId,
    },

    /// Submit an answer for the current round.
    Answer {
        /// Room the answer targets.
        room_id: RoomId,
        /// Round index the client believes is current.
        round_index: usize,
        /// Selected option index.
        option: u8,
    },

    /// Request the authoritative room snapshot (reconnection).
    SyncRequest {
        /// Room to read.
        room_id: RoomId,
    },

    /// Ping for latency measurement.
    Ping {
        /// Client timestamp, echoed back.
        timestamp: u64,
    },

    /// Player is leaving.
    Leave,
}

/// Authentication request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    /// Authentication token (JWT from the external provider).
    pub token: String,
    /// Client version for compatibility check.
    pub client_version: String,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication result.
    AuthResult(AuthResult),

    /// Queue entry accepted.
    QueueJoined {
        /// Position in the queue at join time.
        position: usize,
    },

    /// Queue entry removed at the client's request.
    QueueLeft,

    /// Queue entry evicted after sitting too long unpaired.
    QueueExpired,

    /// Room state-change notification.
    Event(RoomEvent),

    /// Acknowledgment of an answer submission.
    AnswerAck {
        /// Round the submission targeted.
        round_index: usize,
        /// Whether the submission was recorded (false = duplicate).
        accepted: bool,
        /// Whether the answer was correct.
        correct: bool,
    },

    /// Authoritative room snapshot.
    Snapshot(RoomSnapshot),

    /// Pong response.
    Pong {
        /// Echoed client timestamp.
        timestamp: u64,
        /// Server time (Unix millis).
        server_time: u64,
    },

    /// Error message.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown {
        /// Operator-supplied reason.
        reason: String,
    },
}

/// Authentication result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResult {
    /// Whether auth succeeded.
    pub success: bool,
    /// Authenticated identity if successful.
    pub user_id: Option<UserId>,
    /// Error message if failed.
    pub error: Option<String>,
    /// Server version.
    pub server_version: String,
}

/// Server error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ServerError {
    /// Build an error message from a code and display value.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Authentication failed.
    AuthFailed,
    /// Not authenticated.
    NotAuthenticated,
    /// JWT token has expired.
    TokenExpired,
    /// Invalid JWT token (signature, format, claims).
    InvalidToken,
    /// Invalid input (malformed message, out-of-range option).
    InvalidInput,
    /// Room not found.
    RoomNotFound,
    /// Action attempted in the wrong room state.
    InvalidState,
    /// Answer targeted a round that already advanced.
    StaleRound,
    /// Caller is not a participant of the room.
    NotParticipant,
    /// Already in the matchmaking queue.
    AlreadyQueued,
    /// Not in the matchmaking queue.
    NotQueued,
    /// Already bound to a live room.
    AlreadyInRoom,
    /// Stake balance too low.
    InsufficientFunds,
    /// Ledger temporarily unreachable.
    LedgerUnavailable,
    /// Rate limited.
    RateLimited,
    /// Internal error.
    InternalError,
}

impl From<&RoomError> for ErrorCode {
    fn from(err: &RoomError) -> Self {
        match err {
            RoomError::RoomNotFound => ErrorCode::RoomNotFound,
            RoomError::InvalidState { .. } => ErrorCode::InvalidState,
            RoomError::StaleRound { .. } => ErrorCode::StaleRound,
            RoomError::NotParticipant => ErrorCode::NotParticipant,
            RoomError::InvalidParticipants | RoomError::EmptyQuestions => ErrorCode::InternalError,
        }
    }
}

impl From<&QueueError> for ErrorCode {
    fn from(err: &QueueError) -> Self {
        match err {
            QueueError::AlreadyQueued => ErrorCode::AlreadyQueued,
            QueueError::NotQueued => ErrorCode::NotQueued,
        }
    }
}

impl From<&LedgerError> for ErrorCode {
    fn from(err: &LedgerError) -> Self {
        match err {
            LedgerError::Unavailable(_) => ErrorCode::LedgerUnavailable,
            LedgerError::InsufficientFunds { .. } => ErrorCode::InsufficientFunds,
        }
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl RoomSnapshot {
    /// Serialize to binary for archival.
    ///
    /// Snapshots are flat structs, so binary works; the tagged message
    /// enums stay JSON-only.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_json_roundtrip() {
        let msg = ClientMessage::Answer {
            room_id: RoomId::new([5; 16]),
            round_index: 7,
            option: 2,
        };

        let json = msg.to_json().unwrap();
        let parsed = ClientMessage::from_json(&json).unwrap();

        if let ClientMessage::Answer {
            round_index,
            option,
            ..
        } = parsed
        {
            assert_eq!(round_index, 7);
            assert_eq!(option, 2);
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_server_message_json_roundtrip() {
        let msg = ServerMessage::Event(RoomEvent::RoundAdvanced {
            room_id: RoomId::new([1; 16]),
            index: 3,
            correct_answer: 1,
            scores: [2, 1],
        });

        let json = msg.to_json().unwrap();
        let parsed = ServerMessage::from_json(&json).unwrap();

        if let ServerMessage::Event(RoomEvent::RoundAdvanced { index, scores, .. }) = parsed {
            assert_eq!(index, 3);
            assert_eq!(scores, [2, 1]);
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_snapshot_binary_roundtrip() {
        use crate::game::room::tests::{make_room, user};

        let mut room = make_room(5);
        let now = chrono::Utc::now();
        room.confirm(user(1), now).unwrap();
        room.confirm(user(2), now).unwrap();

        let snap = room.snapshot(now);
        let bytes = snap.to_bytes().unwrap();
        let parsed = RoomSnapshot::from_bytes(&bytes).unwrap();

        assert_eq!(parsed.id, snap.id);
        assert_eq!(parsed.status, snap.status);
        assert_eq!(parsed.current_round, snap.current_round);
        assert_eq!(parsed.question_count, 5);
        assert_eq!(parsed.started_at, snap.started_at);
        assert_eq!(parsed.scores, snap.scores);
    }

    #[test]
    fn test_join_queue_tag_format() {
        let msg = ClientMessage::JoinQueue {
            stake: 70,
            character: 3,
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains("join_queue"));
    }

    #[test]
    fn test_error_codes() {
        let error = ServerError::new(ErrorCode::StaleRound, "submitted 3, current 5");
        let msg = ServerMessage::Error(error);
        let json = msg.to_json().unwrap();
        assert!(json.contains("stale_round"));
    }

    #[test]
    fn test_room_error_mapping() {
        assert_eq!(
            ErrorCode::from(&RoomError::StaleRound {
                submitted: 1,
                current: 2
            }),
            ErrorCode::StaleRound
        );
        assert_eq!(ErrorCode::from(&RoomError::RoomNotFound), ErrorCode::RoomNotFound);
        assert_eq!(
            ErrorCode::from(&QueueError::AlreadyQueued),
            ErrorCode::AlreadyQueued
        );
        assert_eq!(
            ErrorCode::from(&LedgerError::Unavailable("down".into())),
            ErrorCode::LedgerUnavailable
        );
    }

    #[test]
    fn test_auth_result_serialization() {
        let msg = ServerMessage::AuthResult(AuthResult {
            success: true,
            user_id: Some(UserId::new([9; 16])),
            error: None,
            server_version: "0.1.0".into(),
        });
        let json = msg.to_json().unwrap();
        assert!(json.contains("auth_result"));
        let _ = ServerMessage::from_json(&json).unwrap();
    }
}
