#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use banksync::clock::FixedClock;
use banksync::models::{BankConnection, ConnectionStatus, Id, Transaction, User};
use banksync::provider::{ProviderClient, TransactionFeed};
use banksync::storage::{MemoryStorage, SaveOutcome, Storage, TransactionFilter};
use banksync::sync::{CancellationFlag, SyncOrchestrator};
use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};

pub fn fixed_clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2026, 2, 20, 6, 0, 0).unwrap(),
    ))
}

/// A booked record in the provider's wire shape.
pub fn record(id: &str, date: &str, amount: &str) -> Value {
    json!({
        "transactionId": id,
        "bookingDate": date,
        "valueDate": date,
        "transactionAmount": {"amount": amount, "currency": "EUR"},
        "remittanceInformationUnstructured": format!("payment {id}")
    })
}

pub async fn seed_user(storage: &dyn Storage, username: &str) -> Result<User> {
    let user = User::new(username, fixed_clock().as_ref());
    storage.save_user(&user).await?;
    Ok(user)
}

/// Create a connection for `user` and walk it to `status`.
pub async fn seed_connection(
    storage: &dyn Storage,
    user: &User,
    requisition_id: &str,
    status: ConnectionStatus,
) -> Result<BankConnection> {
    let clock = fixed_clock();
    let mut connection = BankConnection::new(
        user.id.clone(),
        "SANDBOXFINANCE_SFIN0000",
        requisition_id,
        format!("ref-{requisition_id}"),
        clock.as_ref(),
    );
    match status {
        ConnectionStatus::Created => {}
        ConnectionStatus::Pending => {
            connection.transition_to(ConnectionStatus::Pending, clock.as_ref())?;
        }
        ConnectionStatus::Linked => {
            connection.transition_to(ConnectionStatus::Pending, clock.as_ref())?;
            connection.confirm_callback(None, clock.as_ref())?;
        }
        ConnectionStatus::Error => {
            connection.confirm_callback(Some("access denied"), clock.as_ref())?;
        }
    }
    storage.save_connection(&connection).await?;
    Ok(connection)
}

/// Scripted provider. Unknown requisitions and accounts answer with an error.
#[derive(Default)]
pub struct MockProvider {
    accounts: Mutex<HashMap<String, Result<Vec<String>, String>>>,
    feeds: Mutex<HashMap<String, Result<TransactionFeed, String>>>,
    balances: Mutex<HashMap<String, Result<Decimal, String>>>,
    feed_delays: Mutex<HashMap<String, Duration>>,
    cancel_after_feed: Mutex<Option<(String, CancellationFlag)>>,
    pub feed_calls: AtomicUsize,
    pub balance_calls: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accounts(self, requisition_id: &str, accounts: &[&str]) -> Self {
        self.accounts.lock().unwrap().insert(
            requisition_id.to_string(),
            Ok(accounts.iter().map(|a| a.to_string()).collect()),
        );
        self
    }

    pub fn failing_accounts(self, requisition_id: &str, message: &str) -> Self {
        self.accounts
            .lock()
            .unwrap()
            .insert(requisition_id.to_string(), Err(message.to_string()));
        self
    }

    pub fn with_feed(self, account_id: &str, booked: Vec<Value>) -> Self {
        self.set_feed(account_id, TransactionFeed::new(booked, Vec::new()));
        self
    }

    pub fn with_full_feed(self, account_id: &str, feed: TransactionFeed) -> Self {
        self.set_feed(account_id, feed);
        self
    }

    pub fn failing_feed(self, account_id: &str, message: &str) -> Self {
        self.feeds
            .lock()
            .unwrap()
            .insert(account_id.to_string(), Err(message.to_string()));
        self
    }

    pub fn slow_feed(self, account_id: &str, delay: Duration) -> Self {
        self.feed_delays
            .lock()
            .unwrap()
            .insert(account_id.to_string(), delay);
        self
    }

    pub fn with_balance(self, account_id: &str, balance: Decimal) -> Self {
        self.balances
            .lock()
            .unwrap()
            .insert(account_id.to_string(), Ok(balance));
        self
    }

    pub fn failing_balance(self, account_id: &str, message: &str) -> Self {
        self.balances
            .lock()
            .unwrap()
            .insert(account_id.to_string(), Err(message.to_string()));
        self
    }

    /// Trip `flag` right after the feed for `account_id` has been served.
    pub fn cancel_after_feed(self, account_id: &str, flag: CancellationFlag) -> Self {
        *self.cancel_after_feed.lock().unwrap() = Some((account_id.to_string(), flag));
        self
    }

    /// Replace an account's feed between runs.
    pub fn set_feed(&self, account_id: &str, feed: TransactionFeed) {
        self.feeds
            .lock()
            .unwrap()
            .insert(account_id.to_string(), Ok(feed));
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    async fn list_accounts(&self, requisition_id: &str) -> Result<Vec<String>> {
        let scripted = self.accounts.lock().unwrap().get(requisition_id).cloned();
        match scripted {
            Some(Ok(accounts)) => Ok(accounts),
            Some(Err(message)) => anyhow::bail!(message),
            None => anyhow::bail!("unknown requisition {requisition_id}"),
        }
    }

    async fn list_transactions(&self, account_id: &str) -> Result<TransactionFeed> {
        self.feed_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.feed_delays.lock().unwrap().get(account_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.feeds.lock().unwrap().get(account_id).cloned();
        let feed = match scripted {
            Some(Ok(feed)) => feed,
            Some(Err(message)) => anyhow::bail!(message),
            None => anyhow::bail!("unknown account {account_id}"),
        };

        if let Some((trigger, flag)) = self.cancel_after_feed.lock().unwrap().as_ref() {
            if trigger == account_id {
                flag.cancel();
            }
        }
        Ok(feed)
    }

    async fn current_balance(&self, account_id: &str) -> Result<Decimal> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.balances.lock().unwrap().get(account_id).cloned();
        match scripted {
            Some(Ok(balance)) => Ok(balance),
            Some(Err(message)) => anyhow::bail!(message),
            None => anyhow::bail!("no balance for {account_id}"),
        }
    }
}

/// Wraps [`MemoryStorage`] and fails or fakes selected transaction writes.
#[derive(Default)]
pub struct FaultyStorage {
    pub inner: MemoryStorage,
    fail_saves: Mutex<HashSet<String>>,
    fake_duplicates: Mutex<HashSet<String>>,
}

impl FaultyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// `save_transaction` for this id returns an error.
    pub fn fail_save(self, transaction_id: &str) -> Self {
        self.fail_saves
            .lock()
            .unwrap()
            .insert(transaction_id.to_string());
        self
    }

    /// `save_transaction` for this id reports a duplicate, as if a concurrent
    /// sync had written it between the lookup and the insert.
    pub fn duplicate_on_save(self, transaction_id: &str) -> Self {
        self.fake_duplicates
            .lock()
            .unwrap()
            .insert(transaction_id.to_string());
        self
    }
}

#[async_trait]
impl Storage for FaultyStorage {
    async fn get_user(&self, id: &Id) -> Result<Option<User>> {
        self.inner.get_user(id).await
    }

    async fn save_user(&self, user: &User) -> Result<()> {
        self.inner.save_user(user).await
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        self.inner.list_users().await
    }

    async fn get_connection(&self, id: &Id) -> Result<Option<BankConnection>> {
        self.inner.get_connection(id).await
    }

    async fn save_connection(&self, connection: &BankConnection) -> Result<()> {
        self.inner.save_connection(connection).await
    }

    async fn connections_for_user(&self, user_id: &Id) -> Result<Vec<BankConnection>> {
        self.inner.connections_for_user(user_id).await
    }

    async fn find_connection_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<BankConnection>> {
        self.inner.find_connection_by_reference(reference).await
    }

    async fn existing_transaction_ids(&self, candidate_ids: &[String]) -> Result<Vec<String>> {
        self.inner.existing_transaction_ids(candidate_ids).await
    }

    async fn save_transaction(&self, transaction: &Transaction) -> Result<SaveOutcome> {
        if self
            .fail_saves
            .lock()
            .unwrap()
            .contains(&transaction.transaction_id)
        {
            anyhow::bail!("store unavailable for {}", transaction.transaction_id);
        }
        if self
            .fake_duplicates
            .lock()
            .unwrap()
            .contains(&transaction.transaction_id)
        {
            return Ok(SaveOutcome::Duplicate);
        }
        self.inner.save_transaction(transaction).await
    }

    async fn most_recent_transaction(&self, account_id: &str) -> Result<Option<Transaction>> {
        self.inner.most_recent_transaction(account_id).await
    }

    async fn transactions_for_account(&self, account_id: &str) -> Result<Vec<Transaction>> {
        self.inner.transactions_for_account(account_id).await
    }

    async fn transactions_for_user(
        &self,
        user_id: &Id,
        filter: &TransactionFilter,
    ) -> Result<Vec<Transaction>> {
        self.inner.transactions_for_user(user_id, filter).await
    }
}

/// Orchestrator on the fixed test clock with default options.
pub fn orchestrator(storage: Arc<dyn Storage>, provider: Arc<MockProvider>) -> SyncOrchestrator {
    SyncOrchestrator::new(storage, provider).with_clock(fixed_clock())
}
