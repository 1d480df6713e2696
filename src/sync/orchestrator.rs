//! Per-user reconciliation run.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::duration::format_duration;
use crate::models::{BalancePrecision, BankConnection, Id, Transaction};
use crate::provider::ProviderClient;
use crate::storage::{SaveOutcome, Storage};

use super::balance::{reconstruct, select_anchor};
use super::dedup::filter_new;
use super::normalize::normalize_feed;

/// Failures that abort a whole sync. Everything else is reported per
/// connection or account in [`SyncResult`].
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("unknown user: {0}")]
    UnknownUser(Id),
    #[error("storage unavailable: {0:#}")]
    Storage(anyhow::Error),
}

/// Shared stop signal. Checked before each account starts; work already in
/// flight finishes normally.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Width of the worker pool for account listings and account pipelines.
    pub max_concurrent_accounts: usize,
    /// Deadline for each outbound provider call.
    pub call_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for SyncOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_concurrent_accounts: config.max_concurrent_accounts.max(1),
            call_timeout: config.call_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Synced,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRecordReport {
    pub index: usize,
    pub transaction_id: Option<String>,
    pub reason: String,
}

/// Outcome of one account pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct AccountReport {
    pub account_id: String,
    pub status: AccountStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Raw records returned by the provider.
    pub fetched: usize,
    pub new_transactions: usize,
    pub already_known: usize,
    pub repeated_in_batch: usize,
    pub rejected: Vec<RejectedRecordReport>,
    /// Rejection counts keyed by reason.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub rejected_by_reason: BTreeMap<String, usize>,
    /// Late duplicates caught by the store's uniqueness check.
    pub duplicate_collisions: usize,
    pub persistence_failures: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance_precision: Option<BalancePrecision>,
    pub provider_balance_mismatches: usize,
    #[serde(skip)]
    pub persisted: Vec<Transaction>,
}

impl AccountReport {
    fn new(account_id: &str, status: AccountStatus) -> Self {
        Self {
            account_id: account_id.to_string(),
            status,
            error: None,
            fetched: 0,
            new_transactions: 0,
            already_known: 0,
            repeated_in_batch: 0,
            rejected: Vec::new(),
            rejected_by_reason: BTreeMap::new(),
            duplicate_collisions: 0,
            persistence_failures: 0,
            balance_precision: None,
            provider_balance_mismatches: 0,
            persisted: Vec::new(),
        }
    }

    fn failed(account_id: &str, err: &anyhow::Error) -> Self {
        let mut report = Self::new(account_id, AccountStatus::Failed);
        report.error = Some(format!("{err:#}"));
        report
    }

    pub fn is_skipped(&self) -> bool {
        self.status != AccountStatus::Synced
    }
}

/// Outcome for one linked connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub connection_id: Id,
    pub requisition_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Account listing never ran because the sync was cancelled first.
    pub cancelled: bool,
    pub accounts: Vec<AccountReport>,
}

impl ConnectionReport {
    fn new(connection: &BankConnection) -> Self {
        Self {
            connection_id: connection.id.clone(),
            requisition_id: connection.requisition_id.clone(),
            error: None,
            cancelled: false,
            accounts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureScope {
    Connection,
    Account,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub scope: FailureScope,
    pub connection_id: Id,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub message: String,
}

/// Aggregated outcome of [`SyncOrchestrator::sync_user`].
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub user_id: Id,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub connections: Vec<ConnectionReport>,
}

impl SyncResult {
    fn accounts(&self) -> impl Iterator<Item = &AccountReport> {
        self.connections.iter().flat_map(|c| c.accounts.iter())
    }

    pub fn new_transactions(&self) -> usize {
        self.accounts().map(|a| a.new_transactions).sum()
    }

    pub fn accounts_synced(&self) -> usize {
        self.accounts().filter(|a| !a.is_skipped()).count()
    }

    pub fn accounts_skipped(&self) -> usize {
        self.accounts().filter(|a| a.is_skipped()).count()
    }

    pub fn failures(&self) -> Vec<SyncFailure> {
        let mut failures = Vec::new();
        for connection in &self.connections {
            if let Some(message) = &connection.error {
                failures.push(SyncFailure {
                    scope: FailureScope::Connection,
                    connection_id: connection.connection_id.clone(),
                    account_id: None,
                    message: message.clone(),
                });
            }
            for account in &connection.accounts {
                if let Some(message) = &account.error {
                    failures.push(SyncFailure {
                        scope: FailureScope::Account,
                        connection_id: connection.connection_id.clone(),
                        account_id: Some(account.account_id.clone()),
                        message: message.clone(),
                    });
                }
            }
        }
        failures
    }

    /// Every transaction written during this run, grouped by account.
    pub fn persisted(&self) -> impl Iterator<Item = &Transaction> {
        self.accounts().flat_map(|a| a.persisted.iter())
    }

    pub fn summary(&self) -> String {
        let mut text = format!(
            "sync completed with {} new transactions, {} accounts skipped",
            self.new_transactions(),
            self.accounts_skipped()
        );
        let failed_connections = self.connections.iter().filter(|c| c.error.is_some()).count();
        if failed_connections > 0 {
            text.push_str(&format!(", {failed_connections} connections failed"));
        }
        if self.cancelled {
            text.push_str(" (cancelled)");
        }
        text
    }
}

/// Drives fetch -> normalize -> dedup -> reconstruct -> persist for every
/// linked connection of a user.
pub struct SyncOrchestrator {
    storage: Arc<dyn Storage>,
    provider: Arc<dyn ProviderClient>,
    clock: Arc<dyn Clock>,
    options: SyncOptions,
    cancellation: CancellationFlag,
}

impl SyncOrchestrator {
    pub fn new(storage: Arc<dyn Storage>, provider: Arc<dyn ProviderClient>) -> Self {
        Self {
            storage,
            provider,
            clock: Arc::new(SystemClock),
            options: SyncOptions::default(),
            cancellation: CancellationFlag::new(),
        }
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationFlag) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn cancellation(&self) -> &CancellationFlag {
        &self.cancellation
    }

    /// Reconcile all linked connections of `user_id`.
    ///
    /// Only an unknown user or an unreadable connection list fails the call;
    /// provider and per-record problems end up in the returned report.
    pub async fn sync_user(&self, user_id: &Id) -> Result<SyncResult, SyncError> {
        let started_at = self.clock.now();

        let user = self
            .storage
            .get_user(user_id)
            .await
            .map_err(SyncError::Storage)?
            .ok_or_else(|| SyncError::UnknownUser(user_id.clone()))?;
        let connections = self
            .storage
            .linked_connections_for_user(&user.id)
            .await
            .map_err(SyncError::Storage)?;

        tracing::info!(
            user_id = %user.id,
            connections = connections.len(),
            "Starting sync"
        );

        let width = self.options.max_concurrent_accounts.max(1);

        let listings: Vec<(BankConnection, Option<Result<Vec<String>>>)> =
            stream::iter(connections)
                .map(|connection| async move {
                    let accounts = self.list_accounts(&connection).await;
                    (connection, accounts)
                })
                .buffered(width)
                .collect()
                .await;

        let mut reports = Vec::with_capacity(listings.len());
        let mut jobs = Vec::new();
        for (slot, (connection, listing)) in listings.into_iter().enumerate() {
            let mut report = ConnectionReport::new(&connection);
            match listing {
                None => report.cancelled = true,
                Some(Ok(accounts)) => {
                    jobs.extend(
                        accounts
                            .into_iter()
                            .map(|account_id| (slot, connection.clone(), account_id)),
                    );
                }
                Some(Err(err)) => {
                    tracing::warn!(
                        connection_id = %connection.id,
                        requisition_id = %connection.requisition_id,
                        error = %err,
                        "Skipping connection, account listing failed"
                    );
                    report.error = Some(format!("{err:#}"));
                }
            }
            reports.push(report);
        }

        let account_reports: Vec<(usize, AccountReport)> = stream::iter(jobs)
            .map(|(slot, connection, account_id)| async move {
                let report = self.sync_account(&connection, &account_id).await;
                (slot, report)
            })
            .buffered(width)
            .collect()
            .await;

        for (slot, report) in account_reports {
            reports[slot].accounts.push(report);
        }

        let result = SyncResult {
            user_id: user.id.clone(),
            started_at,
            finished_at: self.clock.now(),
            cancelled: self.cancellation.is_cancelled(),
            connections: reports,
        };

        tracing::info!(
            user_id = %result.user_id,
            new_transactions = result.new_transactions(),
            accounts_synced = result.accounts_synced(),
            accounts_skipped = result.accounts_skipped(),
            cancelled = result.cancelled,
            "{}",
            result.summary()
        );

        Ok(result)
    }

    /// `None` when cancelled before the listing started.
    async fn list_accounts(&self, connection: &BankConnection) -> Option<Result<Vec<String>>> {
        if self.cancellation.is_cancelled() {
            return None;
        }
        Some(
            self.bounded("account listing", self.provider.list_accounts(&connection.requisition_id))
                .await,
        )
    }

    async fn sync_account(&self, connection: &BankConnection, account_id: &str) -> AccountReport {
        if self.cancellation.is_cancelled() {
            tracing::debug!(account_id, "Sync cancelled before account started");
            return AccountReport::new(account_id, AccountStatus::Cancelled);
        }

        match self.run_account(connection, account_id).await {
            Ok(report) => report,
            Err(err) => {
                tracing::warn!(
                    connection_id = %connection.id,
                    account_id,
                    error = %err,
                    "Skipping account"
                );
                AccountReport::failed(account_id, &err)
            }
        }
    }

    async fn run_account(
        &self,
        connection: &BankConnection,
        account_id: &str,
    ) -> Result<AccountReport> {
        let mut report = AccountReport::new(account_id, AccountStatus::Synced);

        let feed = self
            .bounded("transaction list", self.provider.list_transactions(account_id))
            .await?;
        report.fetched = feed.len();

        let batch = normalize_feed(&feed, account_id, &connection.id, self.clock.as_ref());
        report.rejected = batch
            .rejected
            .iter()
            .map(|r| RejectedRecordReport {
                index: r.index,
                transaction_id: r.transaction_id.clone(),
                reason: r.reason.to_string(),
            })
            .collect();
        report.rejected_by_reason = batch.rejection_summary();
        if !report.rejected_by_reason.is_empty() {
            tracing::warn!(
                account_id,
                reasons = ?report.rejected_by_reason,
                "Skipped unusable provider records"
            );
        }

        let dedup = filter_new(self.storage.as_ref(), batch.transactions).await?;
        report.already_known = dedup.already_known;
        report.repeated_in_batch = dedup.repeated_in_batch;
        if dedup.fresh.is_empty() {
            return Ok(report);
        }

        let anchor = select_anchor(
            self.storage.as_ref(),
            self.provider.as_ref(),
            account_id,
            self.options.call_timeout,
        )
        .await?;
        let rebuilt = reconstruct(dedup.fresh, &anchor);
        report.balance_precision = Some(rebuilt.precision);
        report.provider_balance_mismatches = rebuilt.provider_mismatches;

        for tx in rebuilt.transactions {
            match self.storage.save_transaction(&tx).await {
                Ok(SaveOutcome::Inserted) => {
                    report.new_transactions += 1;
                    report.persisted.push(tx);
                }
                Ok(SaveOutcome::Duplicate) => {
                    tracing::debug!(
                        account_id,
                        transaction_id = %tx.transaction_id,
                        "Transaction already stored, skipping"
                    );
                    report.duplicate_collisions += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        account_id,
                        transaction_id = %tx.transaction_id,
                        error = %err,
                        "Failed to persist transaction"
                    );
                    report.persistence_failures += 1;
                }
            }
        }

        tracing::info!(
            connection_id = %connection.id,
            account_id,
            new_transactions = report.new_transactions,
            already_known = report.already_known,
            rejected = report.rejected.len(),
            "Account synced"
        );

        Ok(report)
    }

    async fn bounded<T>(&self, what: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.options.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!(
                "Provider {what} timed out after {}",
                format_duration(self.options.call_timeout)
            ),
        }
    }
}
