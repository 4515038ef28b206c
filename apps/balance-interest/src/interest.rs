use std::num::NonZeroU32;

use async_trait::async_trait;
use rand::Rng;
use resp_client::{RespConnection, RespError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::accounts::AccountId;

/// Store operations the job needs.
#[async_trait]
pub trait BalanceStore: Send {
    /// # Errors
    /// Returns the store error if the server does not answer `PONG`.
    async fn ping(&mut self) -> Result<(), RespError>;

    /// Atomically add `delta` to the integer at `key`, creating it at zero.
    ///
    /// # Errors
    /// Returns the store error for the request.
    async fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64, RespError>;
}

#[async_trait]
impl<S> BalanceStore for RespConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn ping(&mut self) -> Result<(), RespError> {
        RespConnection::ping(self).await
    }

    async fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64, RespError> {
        RespConnection::incr_by(self, key, delta).await
    }
}

/// Interest drawn per account: uniform over `[0, ceiling)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterestPolicy {
    ceiling: NonZeroU32,
}

impl InterestPolicy {
    /// `None` for a zero ceiling.
    #[must_use]
    pub fn new(ceiling: u32) -> Option<Self> {
        NonZeroU32::new(ceiling).map(|ceiling| Self { ceiling })
    }

    #[must_use]
    pub fn ceiling(self) -> u32 {
        self.ceiling.get()
    }

    pub fn draw<R: Rng + ?Sized>(self, rng: &mut R) -> i64 {
        i64::from(rng.random_range(0..self.ceiling.get()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountUpdate {
    pub account: AccountId,
    pub key: String,
    pub increment: i64,
    pub balance: i64,
}

/// One account could not be updated; the batch continues.
#[derive(Error, Debug)]
#[error("failed to update balance for account {account} ({key}): {source}")]
pub struct AccountUpdateError {
    pub account: AccountId,
    pub key: String,
    pub increment: i64,
    #[source]
    pub source: RespError,
}

/// Per-run result of applying interest.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub updated: Vec<AccountUpdate>,
    pub failed: Vec<AccountUpdateError>,
}

impl BatchReport {
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.updated.len() + self.failed.len()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn log_summary(&self) {
        let interest_total: i64 = self.updated.iter().map(|u| u.increment).sum();
        if self.is_complete() {
            tracing::info!(
                updated = self.updated.len(),
                interest_total,
                "interest applied to all accounts"
            );
        } else {
            tracing::warn!(
                updated = self.updated.len(),
                failed = self.failed.len(),
                interest_total,
                "interest applied with failures"
            );
        }
    }
}

/// Apply one interest draw to every account, in order.
///
/// A failed increment is logged and recorded; later accounts are still
/// attempted. There are no retries.
pub async fn apply_interest<B, R>(
    store: &mut B,
    accounts: &[AccountId],
    policy: InterestPolicy,
    rng: &mut R,
) -> BatchReport
where
    B: BalanceStore + ?Sized,
    R: Rng + ?Sized,
{
    let mut report = BatchReport::default();

    for &account in accounts {
        let increment = policy.draw(rng);
        let key = account.balance_key();

        match store.incr_by(&key, increment).await {
            Ok(balance) => {
                tracing::info!(%account, %key, increment, balance, "balance updated");
                report.updated.push(AccountUpdate {
                    account,
                    key,
                    increment,
                    balance,
                });
            }
            Err(source) => {
                let err = AccountUpdateError {
                    account,
                    key,
                    increment,
                    source,
                };
                tracing::error!(%account, error = %err, "balance update failed");
                report.failed.push(err);
            }
        }
    }

    report
}
