//! Game Logic
//!
//! Matchmaking, room lifecycle, round synchronization, stake
//! settlement, and event fan-out. Everything here is pure game state;
//! transport and auth live in `network`, balances in `ledger`.

pub mod events;
pub mod queue;
pub mod room;
pub mod rounds;
pub mod settlement;
