//! Network Layer
//!
//! WebSocket server for real-time battle communication.
//! This layer is transport only - all game rules run through `game/`.

pub mod auth;
pub mod protocol;
pub mod server;

pub use auth::{validate_token, AuthConfig, AuthError, TokenClaims, VerifyKey};
pub use protocol::{ClientMessage, ErrorCode, ServerError, ServerMessage};
pub use server::{ArenaServer, ArenaServerError, ServerConfig};
