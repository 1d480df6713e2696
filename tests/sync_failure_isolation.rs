mod support;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use banksync::models::{ConnectionStatus, Id};
use banksync::storage::{MemoryStorage, Storage};
use banksync::sync::{AccountStatus, CancellationFlag, FailureScope, SyncError, SyncOptions};
use rust_decimal_macros::dec;
use serde_json::json;
use support::{orchestrator, record, seed_connection, seed_user, FaultyStorage, MockProvider};

#[tokio::test]
async fn failing_connection_does_not_block_the_others() -> Result<()> {
    let memory = Arc::new(MemoryStorage::new());
    let storage: Arc<dyn Storage> = memory.clone();
    let user = seed_user(storage.as_ref(), "alice").await?;
    seed_connection(storage.as_ref(), &user, "req-1", ConnectionStatus::Linked).await?;
    let broken = seed_connection(storage.as_ref(), &user, "req-2", ConnectionStatus::Linked).await?;
    seed_connection(storage.as_ref(), &user, "req-3", ConnectionStatus::Linked).await?;

    let provider = Arc::new(
        MockProvider::new()
            .with_accounts("req-1", &["acc-1"])
            .failing_accounts("req-2", "401 unauthorized")
            .with_accounts("req-3", &["acc-3"])
            .with_feed("acc-1", vec![record("one", "2026-02-01", "-1.00")])
            .with_feed(
                "acc-3",
                vec![
                    record("three-a", "2026-02-03", "3.00"),
                    record("three-b", "2026-02-02", "-2.00"),
                ],
            )
            .with_balance("acc-1", dec!(10.00))
            .with_balance("acc-3", dec!(30.00)),
    );

    let result = orchestrator(storage.clone(), provider)
        .sync_user(&user.id)
        .await?;

    assert_eq!(result.new_transactions(), 3);
    assert_eq!(result.connections.len(), 3);
    let failures = result.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].scope, FailureScope::Connection);
    assert_eq!(failures[0].connection_id, broken.id);
    assert!(failures[0].message.contains("401"));

    assert_eq!(storage.transactions_for_account("acc-1").await?.len(), 1);
    assert_eq!(storage.transactions_for_account("acc-3").await?.len(), 2);
    assert_eq!(memory.transaction_count().await, 3);
    Ok(())
}

#[tokio::test]
async fn failing_account_is_skipped_and_counted() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let user = seed_user(storage.as_ref(), "bob").await?;
    seed_connection(storage.as_ref(), &user, "req-1", ConnectionStatus::Linked).await?;

    let provider = Arc::new(
        MockProvider::new()
            .with_accounts("req-1", &["acc-ok", "acc-bad"])
            .with_feed("acc-ok", vec![record("ok-1", "2026-02-01", "5.00")])
            .failing_feed("acc-bad", "provider returned 500")
            .with_balance("acc-ok", dec!(5.00)),
    );

    let result = orchestrator(storage.clone(), provider)
        .sync_user(&user.id)
        .await?;

    assert_eq!(result.accounts_synced(), 1);
    assert_eq!(result.accounts_skipped(), 1);
    assert_eq!(
        result.summary(),
        "sync completed with 1 new transactions, 1 accounts skipped"
    );

    let accounts = &result.connections[0].accounts;
    assert_eq!(accounts[0].account_id, "acc-ok");
    assert_eq!(accounts[1].status, AccountStatus::Failed);

    let failures = result.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].scope, FailureScope::Account);
    assert_eq!(failures[0].account_id.as_deref(), Some("acc-bad"));
    Ok(())
}

#[tokio::test]
async fn one_unparsable_record_costs_only_itself() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let user = seed_user(storage.as_ref(), "carol").await?;
    seed_connection(storage.as_ref(), &user, "req-1", ConnectionStatus::Linked).await?;

    let provider = Arc::new(
        MockProvider::new()
            .with_accounts("req-1", &["acc-1"])
            .with_feed(
                "acc-1",
                vec![
                    record("r1", "2026-02-05", "1.00"),
                    record("r2", "2026-02-04", "-2.00"),
                    record("bad", "2026-02-03", "twelve"),
                    record("r4", "2026-02-02", "4.00"),
                    record("r5", "2026-02-01", "-5.00"),
                ],
            )
            .with_balance("acc-1", dec!(100.00)),
    );

    let result = orchestrator(storage.clone(), provider)
        .sync_user(&user.id)
        .await?;

    let account = &result.connections[0].accounts[0];
    assert_eq!(account.status, AccountStatus::Synced);
    assert_eq!(account.fetched, 5);
    assert_eq!(account.new_transactions, 4);
    assert_eq!(account.rejected.len(), 1);
    assert_eq!(account.rejected[0].transaction_id.as_deref(), Some("bad"));
    assert!(account.rejected[0].reason.contains("amount"));
    assert_eq!(
        account.rejected_by_reason.get(r#"unparsable amount: "twelve""#),
        Some(&1)
    );

    let stored = storage.transactions_for_account("acc-1").await?;
    assert_eq!(stored.len(), 4);
    assert!(stored.iter().all(|t| t.transaction_id != "bad"));
    Ok(())
}

#[tokio::test]
async fn records_without_any_date_are_rejected() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let user = seed_user(storage.as_ref(), "dora").await?;
    seed_connection(storage.as_ref(), &user, "req-1", ConnectionStatus::Linked).await?;

    let provider = Arc::new(
        MockProvider::new()
            .with_accounts("req-1", &["acc-1"])
            .with_feed(
                "acc-1",
                vec![
                    json!({"transactionId": "undated", "transactionAmount": {"amount": "1.00"}}),
                    record("dated", "2026-02-01", "1.00"),
                ],
            )
            .with_balance("acc-1", dec!(1.00)),
    );

    let result = orchestrator(storage.clone(), provider)
        .sync_user(&user.id)
        .await?;
    let account = &result.connections[0].accounts[0];
    assert_eq!(account.new_transactions, 1);
    assert_eq!(account.rejected.len(), 1);
    assert!(account.rejected[0].reason.contains("date"));
    Ok(())
}

#[tokio::test]
async fn slow_provider_call_times_out_that_account_only() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let user = seed_user(storage.as_ref(), "eve").await?;
    seed_connection(storage.as_ref(), &user, "req-1", ConnectionStatus::Linked).await?;

    let provider = Arc::new(
        MockProvider::new()
            .with_accounts("req-1", &["acc-slow", "acc-fast"])
            .with_feed("acc-slow", vec![record("slow-1", "2026-02-01", "1.00")])
            .slow_feed("acc-slow", Duration::from_secs(2))
            .with_feed("acc-fast", vec![record("fast-1", "2026-02-01", "1.00")])
            .with_balance("acc-fast", dec!(1.00)),
    );

    let result = orchestrator(storage.clone(), provider)
        .with_options(SyncOptions {
            max_concurrent_accounts: 2,
            call_timeout: Duration::from_millis(100),
        })
        .sync_user(&user.id)
        .await?;

    let accounts = &result.connections[0].accounts;
    assert_eq!(accounts[0].status, AccountStatus::Failed);
    assert!(accounts[0].error.as_deref().unwrap_or("").contains("timed out"));
    assert_eq!(accounts[1].status, AccountStatus::Synced);
    assert_eq!(accounts[1].new_transactions, 1);
    assert!(storage.transactions_for_account("acc-slow").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn cancellation_stops_before_the_next_account() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let user = seed_user(storage.as_ref(), "finn").await?;
    seed_connection(storage.as_ref(), &user, "req-1", ConnectionStatus::Linked).await?;

    let flag = CancellationFlag::new();
    let provider = Arc::new(
        MockProvider::new()
            .with_accounts("req-1", &["acc-1", "acc-2", "acc-3"])
            .with_feed("acc-1", vec![record("a1", "2026-02-01", "1.00")])
            .with_feed("acc-2", vec![record("a2", "2026-02-01", "1.00")])
            .with_feed("acc-3", vec![record("a3", "2026-02-01", "1.00")])
            .with_balance("acc-1", dec!(1.00))
            .with_balance("acc-2", dec!(1.00))
            .with_balance("acc-3", dec!(1.00))
            .cancel_after_feed("acc-1", flag.clone()),
    );

    let result = orchestrator(storage.clone(), provider)
        .with_options(SyncOptions {
            max_concurrent_accounts: 1,
            call_timeout: Duration::from_secs(5),
        })
        .with_cancellation(flag)
        .sync_user(&user.id)
        .await?;

    assert!(result.cancelled);
    let statuses: Vec<AccountStatus> = result.connections[0]
        .accounts
        .iter()
        .map(|a| a.status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            AccountStatus::Synced,
            AccountStatus::Cancelled,
            AccountStatus::Cancelled
        ]
    );

    // The account in flight finished cleanly.
    let rows = storage.transactions_for_account("acc-1").await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].balance_after_transaction, Some(dec!(1.00)));
    assert!(storage.transactions_for_account("acc-2").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn persistence_failures_skip_single_rows() -> Result<()> {
    let faulty = Arc::new(
        FaultyStorage::new()
            .fail_save("p2")
            .duplicate_on_save("p3"),
    );
    let storage: Arc<dyn Storage> = faulty.clone();
    let user = seed_user(storage.as_ref(), "gail").await?;
    seed_connection(storage.as_ref(), &user, "req-1", ConnectionStatus::Linked).await?;

    let provider = Arc::new(
        MockProvider::new()
            .with_accounts("req-1", &["acc-1"])
            .with_feed(
                "acc-1",
                vec![
                    record("p4", "2026-02-04", "4.00"),
                    record("p3", "2026-02-03", "3.00"),
                    record("p2", "2026-02-02", "2.00"),
                    record("p1", "2026-02-01", "1.00"),
                ],
            )
            .with_balance("acc-1", dec!(10.00)),
    );

    let result = orchestrator(storage.clone(), provider)
        .sync_user(&user.id)
        .await?;

    let account = &result.connections[0].accounts[0];
    assert_eq!(account.status, AccountStatus::Synced);
    assert_eq!(account.new_transactions, 2);
    assert_eq!(account.persistence_failures, 1);
    assert_eq!(account.duplicate_collisions, 1);
    assert!(result.failures().is_empty());

    let ids: Vec<String> = result.persisted().map(|t| t.transaction_id.clone()).collect();
    assert_eq!(ids, vec!["p1".to_string(), "p4".to_string()]);
    assert_eq!(faulty.inner.transaction_count().await, 2);
    Ok(())
}

#[tokio::test]
async fn only_linked_connections_are_synced() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let user = seed_user(storage.as_ref(), "hugo").await?;
    seed_connection(storage.as_ref(), &user, "req-linked", ConnectionStatus::Linked).await?;
    seed_connection(storage.as_ref(), &user, "req-pending", ConnectionStatus::Pending).await?;
    seed_connection(storage.as_ref(), &user, "req-error", ConnectionStatus::Error).await?;

    // Only the linked requisition is scripted; touching the others would fail.
    let provider = Arc::new(
        MockProvider::new()
            .with_accounts("req-linked", &["acc-1"])
            .with_feed("acc-1", Vec::new()),
    );

    let result = orchestrator(storage.clone(), provider)
        .sync_user(&user.id)
        .await?;
    assert_eq!(result.connections.len(), 1);
    assert_eq!(result.connections[0].requisition_id, "req-linked");
    assert!(result.failures().is_empty());
    assert_eq!(result.new_transactions(), 0);
    Ok(())
}

#[tokio::test]
async fn unknown_user_fails_the_whole_sync() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let provider = Arc::new(MockProvider::new());

    let err = orchestrator(storage, provider)
        .sync_user(&Id::from("ghost"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::UnknownUser(ref id) if id.as_str() == "ghost"));
    Ok(())
}
