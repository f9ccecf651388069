//! Battle Clock
//!
//! Remaining match time derived from a single authoritative start
//! instant stored on the room. Both participants (and the server's own
//! timers) compute remaining time from the same epoch, so client clock
//! skew never desynchronizes the match.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Authoritative match clock.
///
/// `remaining = total + bonus - (now - started_at)`, clamped at zero.
/// The bonus pool grows as players answer correctly (+3 s per correct
/// answer in the reference rules) and extends the *total* match time,
/// not any individual round.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BattleClock {
    /// Instant the match entered `Playing`. Set exactly once.
    pub started_at: DateTime<Utc>,
    /// Base match duration in seconds.
    pub total_secs: i64,
    /// Accumulated bonus seconds earned during play.
    pub bonus_secs: i64,
}

impl BattleClock {
    /// Start the clock at `started_at` with the given base duration.
    pub fn start(started_at: DateTime<Utc>, total_secs: i64) -> Self {
        Self {
            started_at,
            total_secs,
            bonus_secs: 0,
        }
    }

    /// Add bonus seconds to the remaining total time.
    pub fn add_bonus(&mut self, secs: i64) {
        self.bonus_secs += secs;
    }

    /// Remaining time at `now`, clamped at zero.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        let deadline = self.started_at
            + Duration::seconds(self.total_secs)
            + Duration::seconds(self.bonus_secs);
        let left = deadline - now;
        if left < Duration::zero() {
            Duration::zero()
        } else {
            left
        }
    }

    /// Whether the match time has fully elapsed at `now`.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.remaining(now) == Duration::zero()
    }
}
