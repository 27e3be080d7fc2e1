//! Resource prediction for transactions.
//!
//! Predictions are an optimization only: the orchestrator re-checks every
//! parallel group against the keys it actually touched, so whenever a
//! prediction cannot be made the transaction is simply scheduled
//! sequentially.

use crate::chain::{ChainContext, ChainContextProvider};
use crate::types::{ParallelType, Transaction, TransactionResourceInfo};
use alloy_primitives::B256;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A cached prediction and the height of the chain it was made on.
#[derive(Debug, Clone)]
struct CachedResource {
    info: TransactionResourceInfo,
    height: u64,
}

/// Produces a [`TransactionResourceInfo`] per transaction.
///
/// Infos are cached by transaction id and reused only while the target
/// contract's code hash is unchanged. Entries for transactions that never
/// reach an accepted block are dropped once the irreversible height passes
/// the height they were cached at.
pub struct ResourceExtractionService {
    provider: Arc<dyn ChainContextProvider>,
    cache: DashMap<B256, CachedResource>,
}

impl ResourceExtractionService {
    pub fn new(provider: Arc<dyn ChainContextProvider>) -> Self {
        Self {
            provider,
            cache: DashMap::new(),
        }
    }

    /// Predicts the resources of one transaction. Safe to call concurrently.
    pub fn get_resource_info(
        &self,
        ctx: &ChainContext,
        transaction: &Transaction,
    ) -> TransactionResourceInfo {
        let transaction_id = transaction.hash();
        let Some(contract_hash) = self.provider.contract_hash(ctx, &transaction.to) else {
            return TransactionResourceInfo::invalid_contract_address(transaction_id);
        };

        if let Some(cached) = self.cache.get(&transaction_id) {
            if cached.info.contract_hash == Some(contract_hash) {
                trace!(%transaction_id, "resource info cache hit");
                return cached.info.clone();
            }
        }

        let info = match self.provider.declared_resources(ctx, transaction) {
            Ok(Some(declaration)) if !declaration.non_parallelizable => TransactionResourceInfo {
                transaction_id,
                write_paths: declaration.write_paths,
                read_paths: declaration.read_paths,
                contract_hash: Some(contract_hash),
                parallel_type: ParallelType::Parallelizable,
            },
            Ok(_) => TransactionResourceInfo::non_parallelizable(transaction_id, Some(contract_hash)),
            Err(err) => {
                // Not cached, the metadata may be available next time.
                debug!(%transaction_id, %err, "resource prediction unavailable");
                return TransactionResourceInfo::non_parallelizable(
                    transaction_id,
                    Some(contract_hash),
                );
            }
        };

        self.cache.insert(
            transaction_id,
            CachedResource {
                info: info.clone(),
                height: ctx.block_height,
            },
        );
        info
    }

    /// Prefetches the resources of a transaction that just entered the pool,
    /// so grouping a block that includes it hits the cache.
    pub fn handle_transaction_accepted(&self, ctx: &ChainContext, transaction: &Transaction) {
        let info = self.get_resource_info(ctx, transaction);
        trace!(transaction_id = %info.transaction_id, parallel_type = ?info.parallel_type, "resources prefetched");
    }

    /// Predicts the resources of a batch, one info per transaction in order.
    ///
    /// Once `cancel` fires, remaining transactions are only resolved, not
    /// predicted, and come back non-parallelizable.
    pub fn get_resource_infos(
        &self,
        ctx: &ChainContext,
        transactions: &[Transaction],
        cancel: &CancellationToken,
    ) -> Vec<TransactionResourceInfo> {
        transactions
            .iter()
            .map(|transaction| {
                if !cancel.is_cancelled() {
                    return self.get_resource_info(ctx, transaction);
                }
                let transaction_id = transaction.hash();
                match self.provider.contract_hash(ctx, &transaction.to) {
                    Some(hash) => TransactionResourceInfo::non_parallelizable(transaction_id, Some(hash)),
                    None => TransactionResourceInfo::invalid_contract_address(transaction_id),
                }
            })
            .collect()
    }

    /// Drops cached infos of transactions whose prediction proved wrong.
    pub fn clear_conflicting_transactions_resource_cache(&self, transaction_ids: &[B256]) {
        for id in transaction_ids {
            self.cache.remove(id);
        }
    }

    /// Drops cached infos of transactions included in an accepted block.
    pub fn handle_block_accepted(&self, transaction_ids: &[B256]) {
        for id in transaction_ids {
            self.cache.remove(id);
        }
        debug!(
            cleared = transaction_ids.len(),
            remaining = self.cache.len(),
            "resource cache pruned for accepted block"
        );
    }

    /// Drops every info cached on a chain no higher than the new
    /// irreversible block.
    pub fn handle_new_irreversible_block_found(&self, irreversible_height: u64) {
        let before = self.cache.len();
        self.cache.retain(|_, cached| cached.height > irreversible_height);
        debug!(
            irreversible_height,
            cleared = before.saturating_sub(self.cache.len()),
            remaining = self.cache.len(),
            "resource cache pruned below irreversible block"
        );
    }

    /// Number of cached infos.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}
