//! Core Primitives
//!
//! Identifier newtypes and the authoritative battle clock.

pub mod clock;
pub mod ids;
