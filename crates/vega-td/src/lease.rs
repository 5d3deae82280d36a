//! Exclusive per-account session leases.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;
use vega_core::Result;
use vega_core::resilience::CircuitBreaker;
use vega_core::types::AccountId;

use crate::BrokerSession;

/// Borrowed right to use one account's session.
///
/// Holding the lease excludes every other holder for the same account. The
/// exclusion ends when the lease is dropped, which also happens while
/// unwinding from a panic.
pub struct SessionLease {
    account_id: AccountId,
    session: Arc<dyn BrokerSession>,
    breaker: Arc<CircuitBreaker>,
    _guard: OwnedMutexGuard<()>,
}

impl SessionLease {
    pub fn new(
        account_id: AccountId,
        session: Arc<dyn BrokerSession>,
        breaker: Arc<CircuitBreaker>,
        guard: OwnedMutexGuard<()>,
    ) -> Self {
        Self {
            account_id,
            session,
            breaker,
            _guard: guard,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn session(&self) -> &Arc<dyn BrokerSession> {
        &self.session
    }

    /// Breaker guarding this account's brokerage calls.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

/// Source of account sessions for the executor.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Wait up to `timeout` for exclusive use of `account_id`'s session.
    async fn lease(&self, account_id: &str, timeout: Duration) -> Result<SessionLease>;

    /// Next healthy account for work that did not name one.
    async fn pick_account(&self) -> Option<AccountId>;

    fn has_account(&self, account_id: &str) -> bool;
}
