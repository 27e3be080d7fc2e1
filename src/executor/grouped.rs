//! Grouped parallel executor wrapper.
//!
//! This module wires the `group-executor` services to the counter VM and
//! implements the [`Executor`] trait for use in benchmarks. Conflict reports
//! are drained after every block, so a contract caught mispredicting is run
//! sequentially in later blocks on the same branch.

use crate::contracts::ContractRegistry;
use crate::executor::{ExecutionResult, Executor, OrderingMode};
use crate::vm::CounterVm;
use crate::Workload;
use group_executor::{
    sort_by_block_order, BlockStateSet, ConflictReportConsumer, ConflictReportHandler,
    ConflictingTransactionIdentificationService, ContractRemarksService, ExecutorConfig,
    FinalizationEvent, FinalizationEventHandler, GrouperConfig, ParallelTransactionExecutingService,
    ResourceExtractionService, Transaction, TransactionExecutingDto, TransactionGrouper,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Configuration for the grouped parallel executor.
#[derive(Debug, Clone, Default)]
pub struct GroupedExecutorConfig {
    pub executor: ExecutorConfig,
    pub grouper: GrouperConfig,
    pub ordering: OrderingMode,
}

/// Grouped parallel executor.
///
/// Holds the scheduler's caches across blocks; it must be used with
/// workloads generated on the registry it was created with.
pub struct GroupedParallelExecutor {
    service: ParallelTransactionExecutingService<CounterVm>,
    conflict_reports: ConflictReportConsumer,
    finalization: FinalizationEventHandler,
    remarks: Arc<ContractRemarksService>,
    ordering: OrderingMode,
}

impl GroupedParallelExecutor {
    /// Creates a grouped executor over contracts deployed in `registry`.
    pub fn new(registry: Arc<ContractRegistry>, config: GroupedExecutorConfig) -> Self {
        let resources = Arc::new(ResourceExtractionService::new(registry.clone()));
        let remarks = Arc::new(ContractRemarksService::new(registry.clone()));
        let grouper = Arc::new(TransactionGrouper::new(
            resources.clone(),
            remarks.clone(),
            config.grouper,
        ));

        let handler = ConflictReportHandler::new(
            Arc::new(ConflictingTransactionIdentificationService::new(
                resources.clone(),
            )),
            resources.clone(),
            remarks.clone(),
        );
        let (reporter, conflict_reports) = ConflictReportConsumer::channel(handler);

        let service = ParallelTransactionExecutingService::new(
            grouper,
            Arc::new(CounterVm::new(registry)),
            config.executor,
        )
        .with_reporter(Arc::new(reporter));

        Self {
            service,
            conflict_reports,
            finalization: FinalizationEventHandler::new(resources, remarks.clone()),
            remarks,
            ordering: config.ordering,
        }
    }

    /// Remark cache shared with the grouper.
    pub fn remarks(&self) -> &ContractRemarksService {
        &self.remarks
    }

    /// Forwards a block lifecycle event to the scheduler's caches.
    pub fn finalize(&self, event: &FinalizationEvent) {
        self.finalization.handle(event);
    }
}

impl Executor for GroupedParallelExecutor {
    fn execute(&self, state: BlockStateSet, workload: &Workload) -> (BlockStateSet, ExecutionResult) {
        let dto = TransactionExecutingDto::new(workload.header.clone(), workload.transactions.clone())
            .with_partial_state(state.clone());

        let block = match self.service.execute(&dto, &CancellationToken::new()) {
            Ok(block) => block,
            Err(err) => {
                error!(%err, "grouped execution failed");
                let result = ExecutionResult {
                    failed: workload.transactions.len(),
                    ..Default::default()
                };
                return (state, result);
            }
        };

        let final_state = block.block_state(state);
        let reports = self.conflict_reports.drain();
        self.finalization.handle(&FinalizationEvent::BlockAccepted {
            block: workload.header.index(),
            transaction_ids: workload.transactions.iter().map(Transaction::hash).collect(),
        });
        info!(
            groups = block.group_count,
            conflicting = block.conflicting.len(),
            reports,
            "grouped block done"
        );

        let mut return_sets = block.return_sets;
        if self.ordering.is_strict() {
            sort_by_block_order(&mut return_sets, &workload.transactions);
        }
        let result = ExecutionResult {
            groups: block.group_count,
            conflicting: block.conflicting.len(),
            ..ExecutionResult::from_return_sets(return_sets)
        };
        (final_state, result)
    }

    fn preserves_order(&self) -> bool {
        self.ordering.is_strict()
    }

    fn name(&self) -> &'static str {
        "grouped_parallel"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SequentialExecutor;
    use crate::WorkloadConfig;

    #[test]
    fn test_grouped_executor_matches_sequential() {
        let workload = Workload::generate(WorkloadConfig {
            num_contracts: 10,
            num_transactions: 40,
            conflict_factor: 0.5,
            ..Default::default()
        });
        let executor = GroupedParallelExecutor::new(
            workload.registry.clone(),
            GroupedExecutorConfig {
                executor: ExecutorConfig { num_threads: 4 },
                ..Default::default()
            },
        );

        let (expected, oracle) = SequentialExecutor::new().execute(workload.create_state(), &workload);
        let (state, result) = executor.execute(workload.create_state(), &workload);

        assert_eq!(state, expected);
        assert_eq!(result.successful, oracle.successful);
        assert_eq!(result.conflicting, 0);
        let ids: Vec<_> = result.return_sets.iter().map(|set| set.transaction_id).collect();
        let expected_ids: Vec<_> = workload.transactions.iter().map(Transaction::hash).collect();
        assert_eq!(ids, expected_ids);
    }

    #[test]
    fn test_loose_ordering_reports_application_order() {
        let workload = Workload::generate(WorkloadConfig {
            num_contracts: 4,
            num_transactions: 30,
            opaque_factor: 0.5,
            seed: 7,
            ..Default::default()
        });
        let executor = GroupedParallelExecutor::new(
            workload.registry.clone(),
            GroupedExecutorConfig {
                ordering: OrderingMode::Loose,
                ..Default::default()
            },
        );
        assert!(!executor.preserves_order());

        let (state, result) = executor.execute(workload.create_state(), &workload);
        let (expected, _) = SequentialExecutor::new().execute(workload.create_state(), &workload);

        assert_eq!(state, expected);
        assert_eq!(state, workload.create_state().with_return_sets(&result.return_sets));
    }
}
