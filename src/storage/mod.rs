mod json_file;
mod memory;

pub use json_file::JsonFileStorage;
pub use memory::MemoryStorage;

use anyhow::Result;
use chrono::NaiveDate;

use crate::models::{BankConnection, ConnectionStatus, Id, Transaction, TransactionType, User};

/// Outcome of writing a single transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted,
    /// A row with the same transaction id already exists; nothing was written.
    Duplicate,
}

/// Criteria for listing a user's stored transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionFilter {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub transaction_type: Option<TransactionType>,
}

impl TransactionFilter {
    pub fn matches(&self, tx: &Transaction) -> bool {
        self.from.map_or(true, |from| tx.transaction_date >= from)
            && self.to.map_or(true, |to| tx.transaction_date <= to)
            && self
                .transaction_type
                .map_or(true, |kind| tx.transaction_type == kind)
    }
}

/// Persistence collaborator for users, connections and the transaction ledger.
///
/// Implementations must enforce transaction id uniqueness in
/// `save_transaction`; the sync pipeline filters duplicates up front and only
/// relies on that check as a backstop.
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    // Users
    async fn get_user(&self, id: &Id) -> Result<Option<User>>;
    async fn save_user(&self, user: &User) -> Result<()>;
    async fn list_users(&self) -> Result<Vec<User>>;

    // Connections
    async fn get_connection(&self, id: &Id) -> Result<Option<BankConnection>>;
    async fn save_connection(&self, connection: &BankConnection) -> Result<()>;
    async fn connections_for_user(&self, user_id: &Id) -> Result<Vec<BankConnection>>;

    async fn linked_connections_for_user(&self, user_id: &Id) -> Result<Vec<BankConnection>> {
        let connections = self.connections_for_user(user_id).await?;
        Ok(connections
            .into_iter()
            .filter(|c| c.status == ConnectionStatus::Linked)
            .collect())
    }

    async fn find_connection_by_reference(&self, reference: &str)
        -> Result<Option<BankConnection>>;

    // Transactions
    /// Return the subset of `candidate_ids` already present in the store.
    async fn existing_transaction_ids(&self, candidate_ids: &[String]) -> Result<Vec<String>>;
    async fn save_transaction(&self, transaction: &Transaction) -> Result<SaveOutcome>;
    /// Latest transaction for an account by transaction date; among equal
    /// dates, the one persisted last.
    async fn most_recent_transaction(&self, account_id: &str) -> Result<Option<Transaction>>;
    async fn transactions_for_account(&self, account_id: &str) -> Result<Vec<Transaction>>;
    /// A user's transactions matching `filter`, newest first.
    async fn transactions_for_user(
        &self,
        user_id: &Id,
        filter: &TransactionFilter,
    ) -> Result<Vec<Transaction>>;
}

/// Pick the most recent transaction from rows in persistence order.
pub(crate) fn latest_by_date<'a, I>(rows: I) -> Option<&'a Transaction>
where
    I: IntoIterator<Item = &'a Transaction>,
{
    // `max_by_key` keeps the last maximum, so insertion order breaks ties.
    rows.into_iter().max_by_key(|tx| tx.transaction_date)
}

/// Sort newest first; equal dates keep the latest-persisted row first.
pub(crate) fn sort_newest_first(rows: &mut [Transaction]) {
    rows.reverse();
    rows.sort_by(|a, b| b.transaction_date.cmp(&a.transaction_date));
}
