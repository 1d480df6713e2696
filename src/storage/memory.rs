//! In-memory storage implementation for tests and embedding.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use tokio::sync::Mutex;

use crate::models::{BankConnection, Id, Transaction, User};

use super::{latest_by_date, sort_newest_first, SaveOutcome, Storage, TransactionFilter};

#[derive(Default)]
struct Ledger {
    ids: HashSet<String>,
    /// Rows in persistence order, per provider account.
    by_account: HashMap<String, Vec<Transaction>>,
}

/// In-memory storage. Transaction writes are serialized behind one lock, so
/// the id uniqueness check and the insert are atomic.
pub struct MemoryStorage {
    users: Mutex<HashMap<Id, User>>,
    connections: Mutex<HashMap<Id, BankConnection>>,
    ledger: Mutex<Ledger>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Total number of stored transactions across all accounts.
    pub async fn transaction_count(&self) -> usize {
        self.ledger.lock().await.ids.len()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn get_user(&self, id: &Id) -> Result<Option<User>> {
        let users = self.users.lock().await;
        Ok(users.get(id).cloned())
    }

    async fn save_user(&self, user: &User) -> Result<()> {
        let mut users = self.users.lock().await;
        users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let users = self.users.lock().await;
        let mut all: Vec<User> = users.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn get_connection(&self, id: &Id) -> Result<Option<BankConnection>> {
        let conns = self.connections.lock().await;
        Ok(conns.get(id).cloned())
    }

    async fn save_connection(&self, connection: &BankConnection) -> Result<()> {
        let mut conns = self.connections.lock().await;
        let clash = conns.values().any(|existing| {
            existing.id != connection.id && existing.requisition_id == connection.requisition_id
        });
        if clash {
            anyhow::bail!(
                "Requisition {} is already attached to another connection",
                connection.requisition_id
            );
        }
        conns.insert(connection.id.clone(), connection.clone());
        Ok(())
    }

    async fn connections_for_user(&self, user_id: &Id) -> Result<Vec<BankConnection>> {
        let conns = self.connections.lock().await;
        let mut owned: Vec<BankConnection> = conns
            .values()
            .filter(|c| &c.user_id == user_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(owned)
    }

    async fn find_connection_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<BankConnection>> {
        let conns = self.connections.lock().await;
        Ok(conns.values().find(|c| c.reference == reference).cloned())
    }

    async fn existing_transaction_ids(&self, candidate_ids: &[String]) -> Result<Vec<String>> {
        if candidate_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ledger = self.ledger.lock().await;
        Ok(candidate_ids
            .iter()
            .filter(|id| ledger.ids.contains(id.as_str()))
            .cloned()
            .collect())
    }

    async fn save_transaction(&self, transaction: &Transaction) -> Result<SaveOutcome> {
        let mut ledger = self.ledger.lock().await;
        if !ledger.ids.insert(transaction.transaction_id.clone()) {
            return Ok(SaveOutcome::Duplicate);
        }
        ledger
            .by_account
            .entry(transaction.account_id.clone())
            .or_default()
            .push(transaction.clone());
        Ok(SaveOutcome::Inserted)
    }

    async fn most_recent_transaction(&self, account_id: &str) -> Result<Option<Transaction>> {
        let ledger = self.ledger.lock().await;
        Ok(ledger
            .by_account
            .get(account_id)
            .and_then(|rows| latest_by_date(rows))
            .cloned())
    }

    async fn transactions_for_account(&self, account_id: &str) -> Result<Vec<Transaction>> {
        let ledger = self.ledger.lock().await;
        Ok(ledger.by_account.get(account_id).cloned().unwrap_or_default())
    }

    async fn transactions_for_user(
        &self,
        user_id: &Id,
        filter: &TransactionFilter,
    ) -> Result<Vec<Transaction>> {
        let connection_ids: HashSet<Id> = self
            .connections_for_user(user_id)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();

        let ledger = self.ledger.lock().await;
        let mut rows: Vec<Transaction> = ledger
            .by_account
            .values()
            .flatten()
            .filter(|tx| connection_ids.contains(&tx.connection_id) && filter.matches(tx))
            .cloned()
            .collect();
        sort_newest_first(&mut rows);
        Ok(rows)
    }
}
