//! Running balance reconstruction.
//!
//! New transactions are replayed backward from a present-day balance: the
//! newest one gets the anchor as its balance-after, then each transaction is
//! undone to get the balance the next older one ended on.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::models::{BalancePrecision, Transaction};
use crate::provider::ProviderClient;
use crate::storage::Storage;

/// Where the replay starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anchor {
    /// Balance-after of the latest stored transaction for the account.
    Persisted {
        balance: Decimal,
        as_of: NaiveDate,
        /// Signed amount of the stored row, undone before replaying rows
        /// dated on or before `as_of`.
        signed_amount: Decimal,
        /// The stored row was itself reconstructed from a fallback anchor.
        estimated: bool,
    },
    /// Current balance reported by the provider.
    Live { balance: Decimal },
    /// No trustworthy balance; replay starts from zero.
    Unavailable { reason: String },
}

impl Anchor {
    pub fn precision(&self) -> BalancePrecision {
        match self {
            Anchor::Persisted {
                estimated: false, ..
            }
            | Anchor::Live { .. } => BalancePrecision::Exact,
            Anchor::Persisted { estimated: true, .. } | Anchor::Unavailable { .. } => {
                BalancePrecision::Estimated
            }
        }
    }
}

/// Pick the anchor for `account_id`: the latest persisted balance if known,
/// otherwise a live snapshot bounded by `call_timeout`. A failed snapshot
/// degrades to [`Anchor::Unavailable`]; only storage errors are returned.
pub async fn select_anchor(
    storage: &dyn Storage,
    provider: &dyn ProviderClient,
    account_id: &str,
    call_timeout: Duration,
) -> Result<Anchor> {
    let latest = storage
        .most_recent_transaction(account_id)
        .await
        .context("Failed to load latest stored transaction")?;

    if let Some(tx) = latest {
        if let Some(balance) = tx.balance_after_transaction {
            return Ok(Anchor::Persisted {
                balance,
                as_of: tx.transaction_date,
                signed_amount: tx.signed_amount(),
                estimated: tx.balance_estimated,
            });
        }
    }

    let snapshot = match tokio::time::timeout(call_timeout, provider.current_balance(account_id)).await
    {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "Balance request timed out after {}s",
            call_timeout.as_secs_f64()
        )),
    };

    match snapshot {
        Ok(balance) => Ok(Anchor::Live { balance }),
        Err(err) => {
            tracing::warn!(
                account_id,
                error = %err,
                "Balance snapshot unavailable, reconstructing from a zero anchor"
            );
            Ok(Anchor::Unavailable {
                reason: format!("{err:#}"),
            })
        }
    }
}

/// Reconstructed rows plus what was learned while replaying them.
#[derive(Debug, Clone)]
pub struct Reconstruction {
    /// Oldest first, the order they should be persisted in.
    pub transactions: Vec<Transaction>,
    pub precision: BalancePrecision,
    /// Rows whose provider-reported balance disagreed with the computed one.
    pub provider_mismatches: usize,
}

/// Assign `balance_after_transaction` to every transaction in `new`.
///
/// Order is by transaction date, newest first; equal dates keep feed order,
/// the earlier record counting as the more recent. A [`Anchor::Persisted`]
/// balance is first carried forward over new transactions dated after it, so
/// that one backward replay covers the whole batch. Back-dated rows continue
/// from the balance before the stored anchor row.
pub fn reconstruct(new: Vec<Transaction>, anchor: &Anchor) -> Reconstruction {
    let precision = anchor.precision();

    let mut ordered = new;
    ordered.sort_by(|a, b| b.transaction_date.cmp(&a.transaction_date));

    let mut running = match anchor {
        Anchor::Persisted { balance, as_of, .. } => {
            *balance
                + ordered
                    .iter()
                    .filter(|tx| tx.transaction_date > *as_of)
                    .map(Transaction::signed_amount)
                    .sum::<Decimal>()
        }
        Anchor::Live { balance } => *balance,
        Anchor::Unavailable { .. } => Decimal::ZERO,
    };

    let mut anchor_row = match anchor {
        Anchor::Persisted {
            as_of,
            signed_amount,
            ..
        } => Some((*as_of, *signed_amount)),
        _ => None,
    };

    let mut provider_mismatches = 0;
    for tx in ordered.iter_mut() {
        if let Some((as_of, signed_amount)) = anchor_row {
            if tx.transaction_date <= as_of {
                running -= signed_amount;
                anchor_row = None;
            }
        }

        tx.balance_after_transaction = Some(running);
        tx.balance_estimated = precision.is_estimated();

        if let Some(reported) = tx.provider_balance_after {
            if reported != running {
                provider_mismatches += 1;
                tracing::warn!(
                    account_id = %tx.account_id,
                    transaction_id = %tx.transaction_id,
                    computed = %running,
                    reported = %reported,
                    "Provider balance disagrees with reconstructed balance"
                );
            }
        }

        running -= tx.signed_amount();
    }

    ordered.reverse();
    Reconstruction {
        transactions: ordered,
        precision,
        provider_mismatches,
    }
}
