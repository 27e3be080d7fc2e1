//! Pinpoints which transactions caused a parallel conflict.
//!
//! A rejected group may hold innocent transactions that were merely grouped
//! with an offender. Only transactions whose actual accesses overlap someone
//! else's *and* fall outside their own prediction are blamed.

use crate::chain::ChainContext;
use crate::claims::{KeyClaims, Owner};
use crate::resource::ResourceExtractionService;
use crate::types::{ExecutionReturnSet, ParallelType, Transaction, TransactionResourceInfo};
use alloy_primitives::B256;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Claim owner shared by all accepted return sets.
const ACCEPTED: Owner = Owner::MAX;

pub struct ConflictingTransactionIdentificationService {
    resource_extraction: Arc<ResourceExtractionService>,
}

impl ConflictingTransactionIdentificationService {
    pub fn new(resource_extraction: Arc<ResourceExtractionService>) -> Self {
        Self {
            resource_extraction,
        }
    }

    /// Returns the conflicting transactions whose contracts mispredicted
    /// their resources, with the prediction that was wrong.
    ///
    /// `transactions` must contain the transactions of `conflicting_sets`;
    /// sets without a matching transaction are ignored.
    pub fn identify(
        &self,
        ctx: &ChainContext,
        accepted_sets: &[ExecutionReturnSet],
        conflicting_sets: &[ExecutionReturnSet],
        transactions: &[Transaction],
    ) -> Vec<(Transaction, TransactionResourceInfo)> {
        let by_id: HashMap<B256, &Transaction> =
            transactions.iter().map(|tx| (tx.hash(), tx)).collect();

        let wrong: Vec<_> = possible_conflicting_sets(accepted_sets, conflicting_sets)
            .into_iter()
            .filter_map(|set| {
                let transaction = *by_id.get(&set.transaction_id)?;
                let info = self.resource_extraction.get_resource_info(ctx, transaction);
                let mispredicted =
                    info.parallel_type == ParallelType::Parallelizable && !info.covers(set);
                mispredicted.then(|| (transaction.clone(), info))
            })
            .collect();

        debug!(
            conflicting = conflicting_sets.len(),
            mispredicted = wrong.len(),
            "identified conflicting transactions"
        );
        wrong
    }
}

/// Conflicting sets whose ground truth overlaps an accepted set or another
/// conflicting set on a path at least one side writes.
fn possible_conflicting_sets<'a>(
    accepted_sets: &[ExecutionReturnSet],
    conflicting_sets: &'a [ExecutionReturnSet],
) -> Vec<&'a ExecutionReturnSet> {
    let mut claims = KeyClaims::new();
    claims.record_all(ACCEPTED, accepted_sets.iter().flat_map(|set| set.accesses()));
    for (owner, set) in conflicting_sets.iter().enumerate() {
        claims.record_all(owner, set.accesses());
    }

    conflicting_sets
        .iter()
        .enumerate()
        .filter(|(owner, set)| !claims.conflicts(*owner, set.accesses()).is_empty())
        .map(|(_, set)| set)
        .collect()
}
