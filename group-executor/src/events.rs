//! Event wiring between the executor and the caches that learn from it.
//!
//! The executor reports conflicts without waiting for anyone to act on them.
//! Reports travel over a crossbeam channel to a [`ConflictReportConsumer`],
//! which attributes the conflict and marks the offending contracts. Block
//! finalization events prune the same caches.

use crate::chain::ChainContext;
use crate::conflict::ConflictingTransactionIdentificationService;
use crate::remarks::ContractRemarksService;
use crate::resource::ResourceExtractionService;
use crate::types::{BlockIndex, ExecutionReturnSet, Transaction};
use alloy_primitives::{Address, B256};
use crossbeam::channel::{self, Receiver, Sender};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Raised when parallel groups turned out to touch overlapping state.
#[derive(Debug, Clone)]
pub struct ConflictingTransactionsFoundInParallelGroups {
    pub previous_block_hash: B256,
    pub previous_block_height: u64,
    /// Return sets merged from the parallel groups.
    pub accepted_return_sets: Vec<ExecutionReturnSet>,
    /// Return sets of rejected groups, relabelled `Conflict`.
    pub conflicting_return_sets: Vec<ExecutionReturnSet>,
    /// Transactions of the rejected groups.
    pub conflicting_transactions: Vec<Transaction>,
}

impl ConflictingTransactionsFoundInParallelGroups {
    /// Context the conflicting block was executed on.
    pub fn chain_context(&self) -> ChainContext {
        ChainContext::new(self.previous_block_hash, self.previous_block_height)
    }
}

/// Sink for conflict reports. Reporting must not block execution.
pub trait ConflictReporter: Send + Sync {
    fn report(&self, event: ConflictingTransactionsFoundInParallelGroups);
}

impl ConflictReporter for Sender<ConflictingTransactionsFoundInParallelGroups> {
    fn report(&self, event: ConflictingTransactionsFoundInParallelGroups) {
        if self.send(event).is_err() {
            debug!("conflict report dropped, consumer is gone");
        }
    }
}

/// Turns a conflict report into remarks on the contracts that caused it.
pub struct ConflictReportHandler {
    identification: Arc<ConflictingTransactionIdentificationService>,
    resource_extraction: Arc<ResourceExtractionService>,
    remarks: Arc<ContractRemarksService>,
}

impl ConflictReportHandler {
    pub fn new(
        identification: Arc<ConflictingTransactionIdentificationService>,
        resource_extraction: Arc<ResourceExtractionService>,
        remarks: Arc<ContractRemarksService>,
    ) -> Self {
        Self {
            identification,
            resource_extraction,
            remarks,
        }
    }

    /// Handles one report and returns the contracts it marked.
    pub fn handle(&self, event: &ConflictingTransactionsFoundInParallelGroups) -> Vec<Address> {
        let ctx = event.chain_context();
        let wrong = self.identification.identify(
            &ctx,
            &event.accepted_return_sets,
            &event.conflicting_return_sets,
            &event.conflicting_transactions,
        );

        let mut marked = BTreeSet::new();
        for (transaction, info) in &wrong {
            let Some(code_hash) = info.contract_hash else {
                continue;
            };
            if marked.insert(transaction.to) {
                self.remarks.set_remark(transaction.to, code_hash, ctx.index());
            }
        }

        let conflicting_ids: Vec<B256> = event
            .conflicting_return_sets
            .iter()
            .map(|set| set.transaction_id)
            .collect();
        self.resource_extraction
            .clear_conflicting_transactions_resource_cache(&conflicting_ids);

        info!(
            block_height = event.previous_block_height + 1,
            conflicting = conflicting_ids.len(),
            marked = marked.len(),
            "handled parallel conflict report"
        );
        marked.into_iter().collect()
    }
}

/// Receiving end of the conflict report channel.
pub struct ConflictReportConsumer {
    receiver: Receiver<ConflictingTransactionsFoundInParallelGroups>,
    handler: ConflictReportHandler,
}

impl ConflictReportConsumer {
    /// Creates a channel whose sender is handed to the executor.
    pub fn channel(
        handler: ConflictReportHandler,
    ) -> (Sender<ConflictingTransactionsFoundInParallelGroups>, Self) {
        let (sender, receiver) = channel::unbounded();
        (sender, Self { receiver, handler })
    }

    /// Handles every report queued so far and returns how many there were.
    pub fn drain(&self) -> usize {
        self.receiver
            .try_iter()
            .map(|event| self.handler.handle(&event))
            .count()
    }

    /// Handles reports until every sender is dropped.
    pub fn run(self) {
        for event in self.receiver.iter() {
            self.handler.handle(&event);
        }
        debug!("conflict report channel closed");
    }

    /// Runs the consumer on its own thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("conflict-reports".to_string())
            .spawn(move || self.run())
    }
}

/// Pool and block lifecycle notifications that feed and prune the
/// scheduler's caches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizationEvent {
    /// A transaction entered the pool while `best_chain` was the tip.
    TransactionAccepted {
        best_chain: BlockIndex,
        transaction: Transaction,
    },
    /// A block was accepted onto some branch.
    BlockAccepted {
        block: BlockIndex,
        transaction_ids: Vec<B256>,
    },
    /// The irreversible block advanced; `discarded` branches are gone for good.
    NewIrreversibleBlockFound {
        irreversible: Vec<BlockIndex>,
        discarded: Vec<BlockIndex>,
    },
}

pub struct FinalizationEventHandler {
    resource_extraction: Arc<ResourceExtractionService>,
    remarks: Arc<ContractRemarksService>,
}

impl FinalizationEventHandler {
    pub fn new(
        resource_extraction: Arc<ResourceExtractionService>,
        remarks: Arc<ContractRemarksService>,
    ) -> Self {
        Self {
            resource_extraction,
            remarks,
        }
    }

    pub fn handle(&self, event: &FinalizationEvent) {
        match event {
            FinalizationEvent::TransactionAccepted {
                best_chain,
                transaction,
            } => {
                self.resource_extraction
                    .handle_transaction_accepted(&ChainContext::from(*best_chain), transaction);
            }
            FinalizationEvent::BlockAccepted {
                block,
                transaction_ids,
            } => {
                debug!(%block, transactions = transaction_ids.len(), "block accepted");
                self.resource_extraction.handle_block_accepted(transaction_ids);
            }
            FinalizationEvent::NewIrreversibleBlockFound {
                irreversible,
                discarded,
            } => {
                if irreversible.is_empty() && discarded.is_empty() {
                    warn!("irreversible block event without blocks");
                    return;
                }
                self.remarks.set_irreversible_cache(irreversible);
                self.remarks.remove_fork_cache(discarded);
                if let Some(height) = irreversible.iter().map(|block| block.height).max() {
                    self.resource_extraction
                        .handle_new_irreversible_block_found(height);
                }
            }
        }
    }
}
