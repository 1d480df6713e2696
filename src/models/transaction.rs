use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::Id;

/// Currency recorded when the provider omits one (ISO 4217 "no currency").
pub const UNKNOWN_CURRENCY: &str = "XXX";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Credit,
    Debit,
}

impl TransactionType {
    /// Classify a signed provider amount. Zero counts as a credit.
    pub fn from_signed(amount: Decimal) -> Self {
        if amount.is_sign_negative() && !amount.is_zero() {
            TransactionType::Debit
        } else {
            TransactionType::Credit
        }
    }

    /// Apply the sign this type stands for to a non-negative magnitude.
    pub fn signed(&self, magnitude: Decimal) -> Decimal {
        match self {
            TransactionType::Credit => magnitude,
            TransactionType::Debit => -magnitude,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Credit => "CREDIT",
            TransactionType::Debit => "DEBIT",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "credit" => Ok(TransactionType::Credit),
            "debit" => Ok(TransactionType::Debit),
            other => anyhow::bail!("Unknown transaction type: {other}. Expected credit or debit."),
        }
    }
}

/// How trustworthy the balances written during one reconciliation are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancePrecision {
    /// Replayed from a persisted balance or a live provider snapshot.
    Exact,
    /// Replayed from a fallback anchor; relative movements are right, the level may not be.
    Estimated,
}

impl BalancePrecision {
    pub fn is_estimated(&self) -> bool {
        matches!(self, BalancePrecision::Estimated)
    }
}

/// Canonical ledger entry.
///
/// `amount` is always a non-negative magnitude; direction lives in
/// `transaction_type`. `transaction_id` is the provider's identifier and the
/// dedup key across the whole store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: String,
    pub account_id: String,
    pub connection_id: Id,
    pub amount: Decimal,
    pub currency: String,
    pub transaction_type: TransactionType,
    pub transaction_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creditor_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debtor_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creditor_account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debtor_account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proprietary_bank_transaction_code: Option<String>,
    /// Balance immediately after this transaction, computed during reconciliation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_after_transaction: Option<Decimal>,
    /// True when the balance was reconstructed without a trustworthy anchor.
    #[serde(default)]
    pub balance_estimated: bool,
    /// Balance the provider reported for this record, kept for cross-checking only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_balance_after: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Signed effect of this transaction on the account balance.
    pub fn signed_amount(&self) -> Decimal {
        self.transaction_type.signed(self.amount)
    }
}
