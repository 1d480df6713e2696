//! Raw provider record -> ledger [`Transaction`].
//!
//! Parsing is two-step: the JSON record is first decoded into the typed
//! [`RawTransaction`], then validated field by field. Every failure names the
//! field that caused it and only rejects that one record.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use crate::clock::Clock;
use crate::models::{Id, Transaction, TransactionType, UNKNOWN_CURRENCY};
use crate::provider::TransactionFeed;

/// Longest description kept on a transaction, in characters.
pub const MAX_DESCRIPTION_CHARS: usize = 500;

/// Why a single raw record could not become a transaction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("record has neither transactionId nor internalTransactionId")]
    MissingTransactionId,
    #[error("record has no transactionAmount.amount")]
    MissingAmount,
    #[error("unparsable amount: {0}")]
    InvalidAmount(String),
    #[error("record has neither a booking date nor a value date")]
    MissingDate,
    #[error("unparsable {field}: {value}")]
    InvalidDate { field: &'static str, value: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawAmount {
    #[serde(default)]
    pub amount: Option<Value>,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAccountRef {
    #[serde(default)]
    pub iban: Option<String>,
    #[serde(default)]
    pub bban: Option<String>,
    #[serde(default)]
    pub masked_pan: Option<String>,
}

impl RawAccountRef {
    fn identifier(&self) -> Option<String> {
        non_empty(self.iban.as_deref())
            .or_else(|| non_empty(self.bban.as_deref()))
            .or_else(|| non_empty(self.masked_pan.as_deref()))
    }
}

/// Typed view of one provider transaction record. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransaction {
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub internal_transaction_id: Option<String>,
    #[serde(default)]
    pub transaction_amount: Option<RawAmount>,
    #[serde(default)]
    pub booking_date: Option<String>,
    #[serde(default)]
    pub booking_date_time: Option<String>,
    #[serde(default)]
    pub value_date: Option<String>,
    #[serde(default)]
    pub value_date_time: Option<String>,
    #[serde(default)]
    pub remittance_information_unstructured: Option<String>,
    #[serde(default)]
    pub remittance_information_unstructured_array: Option<Vec<String>>,
    #[serde(default)]
    pub remittance_information_structured: Option<String>,
    #[serde(default)]
    pub additional_information: Option<String>,
    #[serde(default)]
    pub creditor_name: Option<String>,
    #[serde(default)]
    pub debtor_name: Option<String>,
    #[serde(default)]
    pub creditor_account: Option<RawAccountRef>,
    #[serde(default)]
    pub debtor_account: Option<RawAccountRef>,
    #[serde(default)]
    pub bank_transaction_code: Option<String>,
    #[serde(default)]
    pub proprietary_bank_transaction_code: Option<String>,
    /// Kept loose: a bad value here is dropped, not a record failure.
    #[serde(default)]
    pub balance_after_transaction: Option<Value>,
}

impl RawTransaction {
    pub fn parse(record: &Value) -> Result<Self, NormalizeError> {
        if !record.is_object() {
            return Err(NormalizeError::Malformed("record is not an object".to_string()));
        }
        RawTransaction::deserialize(record).map_err(|e| NormalizeError::Malformed(e.to_string()))
    }

    /// The dedup key: `transactionId`, else `internalTransactionId`.
    pub fn id(&self) -> Option<String> {
        non_empty(self.transaction_id.as_deref())
            .or_else(|| non_empty(self.internal_transaction_id.as_deref()))
    }

    fn signed_amount(&self) -> Result<Decimal, NormalizeError> {
        let raw = self
            .transaction_amount
            .as_ref()
            .and_then(|a| a.amount.as_ref())
            .ok_or(NormalizeError::MissingAmount)?;
        decimal_from_json(raw).ok_or_else(|| NormalizeError::InvalidAmount(raw.to_string()))
    }

    fn description(&self) -> Option<String> {
        let joined = self
            .remittance_information_unstructured_array
            .as_ref()
            .map(|parts| parts.iter().map(|p| p.trim()).collect::<Vec<_>>().join(" "));

        non_empty(self.remittance_information_unstructured.as_deref())
            .or_else(|| non_empty(joined.as_deref()))
            .or_else(|| non_empty(self.remittance_information_structured.as_deref()))
            .or_else(|| non_empty(self.additional_information.as_deref()))
            .map(|text| text.chars().take(MAX_DESCRIPTION_CHARS).collect())
    }

    fn provider_balance_after(&self) -> Option<Decimal> {
        let amount = self
            .balance_after_transaction
            .as_ref()?
            .get("balanceAmount")?
            .get("amount")?;
        decimal_from_json(amount)
    }

    /// Validate and convert into a ledger row for `account_id`.
    pub fn into_transaction(
        self,
        account_id: &str,
        connection_id: &Id,
        now: DateTime<Utc>,
    ) -> Result<Transaction, NormalizeError> {
        let transaction_id = self.id().ok_or(NormalizeError::MissingTransactionId)?;
        let signed = self.signed_amount()?;

        let booking_date = resolve_date(
            ("bookingDate", self.booking_date.as_deref()),
            ("bookingDateTime", self.booking_date_time.as_deref()),
        )?;
        let value_date = resolve_date(
            ("valueDate", self.value_date.as_deref()),
            ("valueDateTime", self.value_date_time.as_deref()),
        )?;
        let transaction_date = booking_date.or(value_date).ok_or(NormalizeError::MissingDate)?;

        let currency = self
            .transaction_amount
            .as_ref()
            .and_then(|a| non_empty(a.currency.as_deref()))
            .map(|c| c.to_ascii_uppercase())
            .unwrap_or_else(|| UNKNOWN_CURRENCY.to_string());

        Ok(Transaction {
            transaction_id,
            account_id: account_id.to_string(),
            connection_id: connection_id.clone(),
            amount: signed.abs(),
            currency,
            transaction_type: TransactionType::from_signed(signed),
            transaction_date,
            booking_date,
            value_date,
            description: self.description(),
            creditor_name: non_empty(self.creditor_name.as_deref()),
            debtor_name: non_empty(self.debtor_name.as_deref()),
            creditor_account: self.creditor_account.as_ref().and_then(RawAccountRef::identifier),
            debtor_account: self.debtor_account.as_ref().and_then(RawAccountRef::identifier),
            transaction_code: non_empty(self.bank_transaction_code.as_deref()),
            proprietary_bank_transaction_code: non_empty(
                self.proprietary_bank_transaction_code.as_deref(),
            ),
            balance_after_transaction: None,
            balance_estimated: false,
            provider_balance_after: self.provider_balance_after(),
            created_at: now,
            updated_at: now,
        })
    }
}

/// Normalize a single raw record.
pub fn normalize_record(
    record: &Value,
    account_id: &str,
    connection_id: &Id,
    now: DateTime<Utc>,
) -> Result<Transaction, NormalizeError> {
    RawTransaction::parse(record)?.into_transaction(account_id, connection_id, now)
}

/// A record that was skipped during normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    /// Position in the feed (booked first, then pending).
    pub index: usize,
    pub transaction_id: Option<String>,
    pub reason: NormalizeError,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub transactions: Vec<Transaction>,
    pub rejected: Vec<RejectedRecord>,
}

impl NormalizedBatch {
    /// Rejection counts keyed by reason text.
    pub fn rejection_summary(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for rejected in &self.rejected {
            *counts.entry(rejected.reason.to_string()).or_insert(0) += 1;
        }
        counts
    }
}

/// Normalize every record of a feed. Booked and pending records are treated
/// alike; bad records are logged and collected, never fatal.
pub fn normalize_feed(
    feed: &TransactionFeed,
    account_id: &str,
    connection_id: &Id,
    clock: &dyn Clock,
) -> NormalizedBatch {
    let now = clock.now();
    let mut batch = NormalizedBatch::default();

    for (index, record) in feed.records().enumerate() {
        match normalize_record(record, account_id, connection_id, now) {
            Ok(tx) => batch.transactions.push(tx),
            Err(reason) => {
                let transaction_id = RawTransaction::parse(record).ok().and_then(|raw| raw.id());
                tracing::warn!(
                    account_id,
                    index,
                    transaction_id = transaction_id.as_deref().unwrap_or("-"),
                    error = %reason,
                    "Skipping unparsable provider record"
                );
                batch.rejected.push(RejectedRecord {
                    index,
                    transaction_id,
                    reason,
                });
            }
        }
    }

    batch
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Exact decimal from a JSON string or number. Numbers are parsed from their
/// textual form so no binary float is involved.
fn decimal_from_json(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

/// Prefer the plain date field, then the date part of the timestamp field.
fn resolve_date(
    date: (&'static str, Option<&str>),
    date_time: (&'static str, Option<&str>),
) -> Result<Option<NaiveDate>, NormalizeError> {
    if let Some(raw) = non_empty(date.1) {
        return NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| NormalizeError::InvalidDate {
                field: date.0,
                value: raw,
            });
    }

    if let Some(raw) = non_empty(date_time.1) {
        if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(Some(dt.date_naive()));
        }
        if let Ok(dt) = NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f") {
            return Ok(Some(dt.date()));
        }
        return Err(NormalizeError::InvalidDate {
            field: date_time.0,
            value: raw,
        });
    }

    Ok(None)
}
