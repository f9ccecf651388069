//! Account Ledger
//!
//! External collaborator holding per-user stake balances. The ledger is
//! the only writer of balances; the settlement engine just issues
//! idempotency-keyed debit/credit instructions through this seam.
//!
//! Amounts are integer tenths of a credit so fractional prize values
//! stay exact (7 credits = 70, 9.5 credits = 95).

use std::collections::BTreeMap;

use tokio::sync::Mutex;
use tracing::debug;

use crate::core::ids::UserId;

/// Monetary amount in tenths of a credit.
pub type Credits = u64;

/// Ledger errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    /// Ledger temporarily unreachable. Retryable with the same
    /// idempotency key.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// Debit would take the balance below zero. Terminal for the
    /// attempt; surfaced to operators, never retried blindly.
    #[error("insufficient funds for user {user}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        /// User whose balance was short.
        user: String,
        /// Balance at the time of the attempt.
        balance: Credits,
        /// Amount that was requested.
        requested: Credits,
    },
}

/// Debit/credit operations with idempotency keys.
///
/// A retried call carrying a key the ledger has already applied is a
/// successful no-op, so crash-replayed settlements never double-move
/// stakes.
pub trait AccountLedger: Send + Sync {
    /// Remove `amount` from `user`'s balance.
    fn debit(
        &self,
        user: UserId,
        amount: Credits,
        idempotency_key: &str,
    ) -> impl std::future::Future<Output = Result<(), LedgerError>> + Send;

    /// Add `amount` to `user`'s balance.
    fn credit(
        &self,
        user: UserId,
        amount: Credits,
        idempotency_key: &str,
    ) -> impl std::future::Future<Output = Result<(), LedgerError>> + Send;
}

struct MemoryLedgerInner {
    balances: BTreeMap<UserId, Credits>,
    applied_keys: BTreeMap<String, ()>,
    /// Number of upcoming calls to fail with `Unavailable`.
    fail_next: u32,
}

/// In-memory ledger for tests and single-node deployments.
pub struct MemoryLedger {
    inner: Mutex<MemoryLedgerInner>,
}

impl MemoryLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryLedgerInner {
                balances: BTreeMap::new(),
                applied_keys: BTreeMap::new(),
                fail_next: 0,
            }),
        }
    }

    /// Set a user's starting balance.
    pub async fn deposit(&self, user: UserId, amount: Credits) {
        let mut inner = self.inner.lock().await;
        *inner.balances.entry(user).or_insert(0) += amount;
    }

    /// Read a user's balance.
    pub async fn balance(&self, user: UserId) -> Credits {
        let inner = self.inner.lock().await;
        inner.balances.get(&user).copied().unwrap_or(0)
    }

    /// Make the next `n` operations fail with `Unavailable`.
    /// Fault injection for retry tests.
    pub async fn fail_next(&self, n: u32) {
        let mut inner = self.inner.lock().await;
        inner.fail_next = n;
    }

    /// Count of distinct idempotency keys applied so far.
    pub async fn applied_key_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.applied_keys.len()
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountLedger for MemoryLedger {
    async fn debit(
        &self,
        user: UserId,
        amount: Credits,
        idempotency_key: &str,
    ) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().await;
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(LedgerError::Unavailable("injected fault".into()));
        }
        if inner.applied_keys.contains_key(idempotency_key) {
            debug!(key = idempotency_key, "debit replayed, already applied");
            return Ok(());
        }
        let balance = inner.balances.get(&user).copied().unwrap_or(0);
        if balance < amount {
            return Err(LedgerError::InsufficientFunds {
                user: user.short(),
                balance,
                requested: amount,
            });
        }
        inner.balances.insert(user, balance - amount);
        inner.applied_keys.insert(idempotency_key.to_string(), ());
        Ok(())
    }

    async fn credit(
        &self,
        user: UserId,
        amount: Credits,
        idempotency_key: &str,
    ) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().await;
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(LedgerError::Unavailable("injected fault".into()));
        }
        if inner.applied_keys.contains_key(idempotency_key) {
            debug!(key = idempotency_key, "credit replayed, already applied");
            return Ok(());
        }
        let balance = inner.balances.get(&user).copied().unwrap_or(0);
        inner.balances.insert(user, balance + amount);
        inner.applied_keys.insert(idempotency_key.to_string(), ());
        Ok(())
    }
}
