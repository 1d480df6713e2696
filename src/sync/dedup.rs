//! Drops candidates whose provider id is already in the store.

use std::collections::HashSet;

use anyhow::{Context, Result};

use crate::models::Transaction;
use crate::storage::Storage;

#[derive(Debug, Clone, Default)]
pub struct DedupOutcome {
    /// Candidates not yet persisted, in feed order.
    pub fresh: Vec<Transaction>,
    /// Candidates whose id the store already holds.
    pub already_known: usize,
    /// Later copies of an id seen earlier in the same batch.
    pub repeated_in_batch: usize,
}

/// Split `candidates` into new and already-persisted rows with one bulk
/// existence lookup. Repeats inside the batch collapse to their first
/// occurrence.
pub async fn filter_new<S: Storage + ?Sized>(
    storage: &S,
    candidates: Vec<Transaction>,
) -> Result<DedupOutcome> {
    let mut outcome = DedupOutcome::default();
    if candidates.is_empty() {
        return Ok(outcome);
    }

    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(candidates.len());
    for tx in candidates {
        if seen.insert(tx.transaction_id.clone()) {
            unique.push(tx);
        } else {
            outcome.repeated_in_batch += 1;
        }
    }

    let ids: Vec<String> = unique.iter().map(|tx| tx.transaction_id.clone()).collect();
    let existing: HashSet<String> = storage
        .existing_transaction_ids(&ids)
        .await
        .context("Bulk transaction id lookup failed")?
        .into_iter()
        .collect();

    for tx in unique {
        if existing.contains(&tx.transaction_id) {
            outcome.already_known += 1;
        } else {
            outcome.fresh.push(tx);
        }
    }

    Ok(outcome)
}
