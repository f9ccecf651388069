//! # Quiz Arena Server
//!
//! Authoritative server for real-time player-vs-player trivia battles.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     QUIZ ARENA SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/             - Shared primitives                      │
//! │  ├── ids.rs        - User and room identifier newtypes      │
//! │  └── clock.rs      - Battle clock (start instant + bonus)   │
//! │                                                              │
//! │  game/             - Match rules (authoritative)            │
//! │  ├── queue.rs      - Stake-tier FIFO matchmaking            │
//! │  ├── room.rs       - Room state machine and registry        │
//! │  ├── rounds.rs     - Round synchronizer and scoring         │
//! │  ├── settlement.rs - Exactly-once stake transfers           │
//! │  └── events.rs     - Per-room event fan-out                 │
//! │                                                              │
//! │  questions/        - Question source seam                   │
//! │  ledger/           - Account balance seam                   │
//! │                                                              │
//! │  network/          - Transport (WebSocket)                  │
//! │  ├── server.rs     - Connection handling and room drivers   │
//! │  ├── protocol.rs   - Message types                          │
//! │  └── auth.rs       - External JWT validation                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Authority Model
//!
//! Every clock and every transition lives on the server:
//! - The single `started_at` instant is stamped once, at the second
//!   confirmation; all remaining-time reads derive from it.
//! - Round deadlines and the confirmation window fire server-side in a
//!   per-room driver task; a silent client cannot stall a match.
//! - Clients reconcile by reading the room snapshot, never by
//!   replaying events.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod ledger;
pub mod network;
pub mod questions;

// Re-export commonly used types
pub use crate::core::clock::BattleClock;
pub use crate::core::ids::{RoomId, UserId};
pub use game::queue::MatchQueue;
pub use game::room::{MatchRules, Room, RoomManager, RoomSnapshot, RoomStatus};
pub use game::settlement::{SettlementEngine, SettlementPolicy};
pub use ledger::{AccountLedger, Credits, MemoryLedger};
pub use questions::{MemoryQuestionSource, Question, QuestionSource};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
