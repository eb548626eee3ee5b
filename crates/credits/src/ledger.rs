//! The credit ledger.
//!
//! ## Design
//!
//! - One balance row per user; debits are compare-and-set against the
//!   observed balance so concurrent admissions never drive it negative
//! - Every operation appends one transaction row; the balance always equals
//!   the signed sum of the log
//! - Refunds are idempotent per `(job_id, reason)`: the orchestrator and the
//!   monitor can both declare a job failed under races without double-paying

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use storyforge_core::{Clock, JobId, SystemClock, UserKey};

/// Credits granted to a user on first sight. Zero disables the grant.
pub const DEFAULT_SIGNUP_BONUS: i64 = 10;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CreditError {
    #[error("insufficient credits: balance is {balance}")]
    InsufficientCredits { balance: i64 },
    #[error("amount must be positive")]
    InvalidAmount,
    #[error("ledger storage error: {0}")]
    Storage(String),
}

/// Kind of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Balance increase: signup bonus, top-up.
    Grant,
    /// Balance decrease: one unit per admitted job.
    Debit,
    /// Balance increase compensating a failed job's debit.
    Refund,
}

/// One row of the transaction log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub user_key: UserKey,
    /// Signed amount: positive for grants/refunds, negative for debits.
    pub amount: i64,
    pub balance_after: i64,
    pub kind: TransactionKind,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
}

/// Atomic debit/credit of user balances with a transaction log.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Current balance, creating the account (with the signup grant) on
    /// first sight of the user.
    async fn balance(&self, user_key: &UserKey) -> Result<i64, CreditError>;

    /// Add credits. Returns the new balance.
    async fn grant(
        &self,
        user_key: &UserKey,
        amount: i64,
        reason: &str,
    ) -> Result<i64, CreditError>;

    /// Atomically subtract `amount`, failing without side effects when the
    /// balance is too low. Returns the new balance.
    async fn debit(
        &self,
        user_key: &UserKey,
        amount: i64,
        reason: &str,
        job_id: Option<&JobId>,
    ) -> Result<i64, CreditError>;

    /// Compensate a debit. Idempotent per `(job_id, reason)`: a second
    /// refund for the same job and reason is a no-op returning the current
    /// balance.
    async fn refund(
        &self,
        user_key: &UserKey,
        amount: i64,
        reason: &str,
        job_id: &JobId,
    ) -> Result<i64, CreditError>;

    /// Most recent transactions for a user, newest first.
    async fn transactions(
        &self,
        user_key: &UserKey,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>, CreditError>;
}

#[derive(Debug, Default, Clone)]
struct Account {
    balance: i64,
    total_used: i64,
}

#[derive(Debug, Default)]
struct LedgerState {
    accounts: HashMap<UserKey, Account>,
    log: Vec<CreditTransaction>,
}

/// In-memory ledger for dev/test. All operations take the state lock for
/// their full duration, which gives the serializable semantics the trait
/// demands.
pub struct InMemoryCreditLedger {
    state: Mutex<LedgerState>,
    signup_bonus: i64,
    clock: Arc<dyn Clock>,
}

impl InMemoryCreditLedger {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            signup_bonus: DEFAULT_SIGNUP_BONUS,
            clock,
        }
    }

    pub fn with_signup_bonus(mut self, bonus: i64) -> Self {
        self.signup_bonus = bonus;
        self
    }

    fn ensure_account(
        &self,
        state: &mut LedgerState,
        user_key: &UserKey,
        now: DateTime<Utc>,
    ) {
        if state.accounts.contains_key(user_key) {
            return;
        }
        state.accounts.insert(user_key.clone(), Account::default());
        if self.signup_bonus > 0 {
            let account = state.accounts.get_mut(user_key).unwrap();
            account.balance += self.signup_bonus;
            state.log.push(CreditTransaction {
                user_key: user_key.clone(),
                amount: self.signup_bonus,
                balance_after: account.balance,
                kind: TransactionKind::Grant,
                reason: "signup_bonus".to_string(),
                job_id: None,
                created_at: now,
            });
        }
    }
}

impl Default for InMemoryCreditLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CreditLedger for InMemoryCreditLedger {
    async fn balance(&self, user_key: &UserKey) -> Result<i64, CreditError> {
        let mut state = self.state.lock().unwrap();
        self.ensure_account(&mut state, user_key, self.clock.now());
        Ok(state.accounts[user_key].balance)
    }

    async fn grant(
        &self,
        user_key: &UserKey,
        amount: i64,
        reason: &str,
    ) -> Result<i64, CreditError> {
        if amount <= 0 {
            return Err(CreditError::InvalidAmount);
        }
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        self.ensure_account(&mut state, user_key, now);

        let account = state.accounts.get_mut(user_key).unwrap();
        account.balance += amount;
        let balance_after = account.balance;
        state.log.push(CreditTransaction {
            user_key: user_key.clone(),
            amount,
            balance_after,
            kind: TransactionKind::Grant,
            reason: reason.to_string(),
            job_id: None,
            created_at: now,
        });
        Ok(balance_after)
    }

    async fn debit(
        &self,
        user_key: &UserKey,
        amount: i64,
        reason: &str,
        job_id: Option<&JobId>,
    ) -> Result<i64, CreditError> {
        if amount <= 0 {
            return Err(CreditError::InvalidAmount);
        }
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        self.ensure_account(&mut state, user_key, now);

        let account = state.accounts.get_mut(user_key).unwrap();
        if account.balance < amount {
            return Err(CreditError::InsufficientCredits {
                balance: account.balance,
            });
        }
        account.balance -= amount;
        account.total_used += amount;
        let balance_after = account.balance;
        state.log.push(CreditTransaction {
            user_key: user_key.clone(),
            amount: -amount,
            balance_after,
            kind: TransactionKind::Debit,
            reason: reason.to_string(),
            job_id: job_id.cloned(),
            created_at: now,
        });
        Ok(balance_after)
    }

    async fn refund(
        &self,
        user_key: &UserKey,
        amount: i64,
        reason: &str,
        job_id: &JobId,
    ) -> Result<i64, CreditError> {
        if amount <= 0 {
            return Err(CreditError::InvalidAmount);
        }
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        self.ensure_account(&mut state, user_key, now);

        let already_refunded = state.log.iter().any(|t| {
            t.kind == TransactionKind::Refund
                && t.reason == reason
                && t.job_id.as_ref() == Some(job_id)
        });
        if already_refunded {
            tracing::debug!(user_key = %user_key, job_id = %job_id, reason, "refund already recorded, skipping");
            return Ok(state.accounts[user_key].balance);
        }

        let account = state.accounts.get_mut(user_key).unwrap();
        account.balance += amount;
        let balance_after = account.balance;
        state.log.push(CreditTransaction {
            user_key: user_key.clone(),
            amount,
            balance_after,
            kind: TransactionKind::Refund,
            reason: reason.to_string(),
            job_id: Some(job_id.clone()),
            created_at: now,
        });
        Ok(balance_after)
    }

    async fn transactions(
        &self,
        user_key: &UserKey,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>, CreditError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<_> = state
            .log
            .iter()
            .filter(|t| &t.user_key == user_key)
            .cloned()
            .collect();
        rows.reverse();
        rows.truncate(limit);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn user(n: u32) -> UserKey {
        UserKey::new(format!("test-user-{n:04}")).unwrap()
    }

    fn ledger() -> InMemoryCreditLedger {
        InMemoryCreditLedger::new()
    }

    #[tokio::test]
    async fn first_sight_grants_the_signup_bonus() {
        let ledger = ledger();
        let u = user(1);
        assert_eq!(ledger.balance(&u).await.unwrap(), DEFAULT_SIGNUP_BONUS);

        let txs = ledger.transactions(&u, 10).await.unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].kind, TransactionKind::Grant);
        assert_eq!(txs[0].reason, "signup_bonus");
    }

    #[tokio::test]
    async fn debit_fails_on_zero_balance_without_side_effects() {
        let ledger = InMemoryCreditLedger::new().with_signup_bonus(0);
        let u = user(2);
        let err = ledger.debit(&u, 1, "book_generation", None).await.unwrap_err();
        assert_eq!(err, CreditError::InsufficientCredits { balance: 0 });
        assert!(ledger.transactions(&u, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn refund_is_idempotent_per_job_and_reason() {
        let ledger = ledger();
        let u = user(3);
        let job = JobId::new();

        ledger.debit(&u, 1, "book_generation", Some(&job)).await.unwrap();
        let after_first = ledger.refund(&u, 1, "job_failed", &job).await.unwrap();
        let after_second = ledger.refund(&u, 1, "job_failed", &job).await.unwrap();

        assert_eq!(after_first, DEFAULT_SIGNUP_BONUS);
        assert_eq!(after_second, after_first);

        let refunds = ledger
            .transactions(&u, 50)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.kind == TransactionKind::Refund)
            .count();
        assert_eq!(refunds, 1);
    }

    #[tokio::test]
    async fn distinct_jobs_refund_independently() {
        let ledger = ledger();
        let u = user(4);
        let a = JobId::new();
        let b = JobId::new();

        ledger.debit(&u, 1, "book_generation", Some(&a)).await.unwrap();
        ledger.debit(&u, 1, "book_generation", Some(&b)).await.unwrap();
        ledger.refund(&u, 1, "job_failed", &a).await.unwrap();
        let balance = ledger.refund(&u, 1, "job_failed", &b).await.unwrap();
        assert_eq!(balance, DEFAULT_SIGNUP_BONUS);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Grant(i64),
        Debit,
        Refund(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1i64..5).prop_map(Op::Grant),
            Just(Op::Debit),
            (0usize..4).prop_map(Op::Refund),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: after any interleaving of grants, debits, and
        /// (possibly duplicate) refunds, the balance is non-negative and
        /// equals the signed sum of the transaction log.
        #[test]
        fn balance_equals_signed_log_sum(ops in prop::collection::vec(op_strategy(), 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            rt.block_on(async {
                let ledger = ledger();
                let u = user(99);
                let jobs: Vec<JobId> = (0..4).map(|_| JobId::new()).collect();
                let mut debited: Vec<JobId> = Vec::new();

                for op in ops {
                    match op {
                        Op::Grant(amount) => {
                            ledger.grant(&u, amount, "top_up").await.unwrap();
                        }
                        Op::Debit => {
                            let job = jobs[debited.len() % jobs.len()].clone();
                            if ledger.debit(&u, 1, "book_generation", Some(&job)).await.is_ok() {
                                debited.push(job);
                            }
                        }
                        Op::Refund(i) => {
                            // Refunds may repeat; idempotence must hold.
                            if let Some(job) = debited.get(i % debited.len().max(1)) {
                                ledger.refund(&u, 1, "job_failed", job).await.unwrap();
                            }
                        }
                    }
                }

                let balance = ledger.balance(&u).await.unwrap();
                prop_assert!(balance >= 0);

                let sum: i64 = ledger
                    .transactions(&u, usize::MAX)
                    .await
                    .unwrap()
                    .iter()
                    .map(|t| t.amount)
                    .sum();
                prop_assert_eq!(balance, sum);
                Ok(())
            })?;
        }
    }
}
