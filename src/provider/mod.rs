//! Open-banking provider port.
//!
//! The sync pipeline only sees [`ProviderClient`]. [`GoCardlessClient`] is
//! the HTTP adapter used by the CLI; tests script the trait directly.

mod gocardless;
mod token;

pub use gocardless::GoCardlessClient;
pub use token::{AccessTokenSource, IssuedToken, TokenCache, TokenIssuer};

use anyhow::Result;
use rust_decimal::Decimal;
use serde_json::Value;

/// Raw transaction records for one account, as the provider returned them.
///
/// Records stay untyped here; parsing into the ledger shape happens in
/// [`crate::sync::normalize`] so one bad record only costs that record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionFeed {
    pub booked: Vec<Value>,
    pub pending: Vec<Value>,
}

impl TransactionFeed {
    pub fn new(booked: Vec<Value>, pending: Vec<Value>) -> Self {
        Self { booked, pending }
    }

    pub fn len(&self) -> usize {
        self.booked.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Booked records first, then pending, each in provider order.
    pub fn records(&self) -> impl Iterator<Item = &Value> {
        self.booked.iter().chain(self.pending.iter())
    }
}

/// Authenticated read access to the provider.
#[async_trait::async_trait]
pub trait ProviderClient: Send + Sync {
    /// Provider account ids attached to a requisition.
    async fn list_accounts(&self, requisition_id: &str) -> Result<Vec<String>>;

    async fn list_transactions(&self, account_id: &str) -> Result<TransactionFeed>;

    /// Current balance of the account, used as the reconstruction anchor fallback.
    async fn current_balance(&self, account_id: &str) -> Result<Decimal>;
}
