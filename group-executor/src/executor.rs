//! Grouped parallel executor.
//!
//! A block is split into groups predicted to touch disjoint state. Groups run
//! concurrently against the same base state, then are merged in group order:
//! a group whose actual accesses overlap an already accepted group is thrown
//! away and its transactions are re-executed sequentially, together with
//! everything that could not be grouped, on top of the accepted changes.

use crate::chain::ChainContext;
use crate::claims::{ClaimResult, KeyClaims};
use crate::errors::{ExecutionError, SchedulerError};
use crate::events::{ConflictReporter, ConflictingTransactionsFoundInParallelGroups};
use crate::grouper::TransactionGrouper;
use crate::scheduler::{Scheduler, Task};
use crate::types::{
    AccessType, BlockHeader, BlockStateSet, ExecutionReturnSet, ExecutionStatus, GroupIndex,
    StatePath, Transaction, TxnIndex, INVALID_CONTRACT_ADDRESS, PARALLEL_CONFLICT,
};
use alloy_primitives::B256;
use crossbeam::channel::{self, Sender};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn};

/// Executes an ordered batch of transactions one after another.
///
/// Each transaction observes `base_state` plus the effects of the earlier
/// transactions of the same batch. Per-transaction failures are `Failed`
/// return sets; `Err` means the batch as a whole produced nothing usable.
/// When `cancel` fires, implementations may stop early and return the
/// prefix they completed.
pub trait PlainTransactionExecutor: Send + Sync {
    fn execute(
        &self,
        transactions: &[Transaction],
        block_header: &BlockHeader,
        base_state: &BlockStateSet,
        cancel: &CancellationToken,
    ) -> Result<Vec<ExecutionReturnSet>, ExecutionError>;
}

/// Configuration for parallel execution.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of worker threads.
    pub num_threads: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            num_threads: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

/// Request to execute the transactions of one block.
#[derive(Debug, Clone)]
pub struct TransactionExecutingDto {
    pub block_header: BlockHeader,
    pub transactions: Vec<Transaction>,
    /// State already produced earlier in the same block, if any.
    pub partial_block_state_set: Option<BlockStateSet>,
    /// `false` runs everything through the plain executor in block order.
    pub is_parallel: bool,
    /// Fail the whole call if sequential execution faults.
    pub throw_on_failure: bool,
}

impl TransactionExecutingDto {
    pub fn new(block_header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            block_header,
            transactions,
            partial_block_state_set: None,
            is_parallel: true,
            throw_on_failure: false,
        }
    }

    pub fn with_partial_state(mut self, state: BlockStateSet) -> Self {
        self.partial_block_state_set = Some(state);
        self
    }

    pub fn sequential(mut self) -> Self {
        self.is_parallel = false;
        self
    }

    pub fn throw_on_failure(mut self) -> Self {
        self.throw_on_failure = true;
        self
    }
}

/// Result of executing a block.
#[derive(Debug, Clone, Default)]
pub struct BlockExecutionResult {
    /// Accepted parallel results, then sequential results, then failures for
    /// transactions without a contract.
    pub return_sets: Vec<ExecutionReturnSet>,
    /// Number of parallel groups.
    pub group_count: usize,
    /// Transactions of rejected or faulted groups, re-executed sequentially.
    pub conflicting: Vec<B256>,
    /// Transactions with no result because execution was cancelled.
    pub unexecuted: Vec<B256>,
    pub cancelled: bool,
    pub duration: Duration,
}

impl BlockExecutionResult {
    /// Final partial state: `base` with every return set applied in order.
    pub fn block_state(&self, base: BlockStateSet) -> BlockStateSet {
        base.with_return_sets(&self.return_sets)
    }
}

/// What became of one parallel group.
#[derive(Debug)]
enum GroupOutcome {
    Executed {
        return_sets: Vec<ExecutionReturnSet>,
        /// Ground-truth keys of the whole group, writes taking precedence.
        accesses: BTreeMap<StatePath, AccessType>,
    },
    Faulted(String),
    /// Cancelled before the group completed; nothing of it is used.
    Incomplete,
}

#[derive(Debug, Default)]
struct MergeResult {
    accepted: Vec<ExecutionReturnSet>,
    conflicting_sets: Vec<ExecutionReturnSet>,
    conflicting_transactions: Vec<Transaction>,
    /// Transactions to re-execute sequentially.
    retry: Vec<Transaction>,
    unexecuted: Vec<Transaction>,
}

#[derive(Debug, Default)]
struct SequentialOutcome {
    return_sets: Vec<ExecutionReturnSet>,
    unexecuted: Vec<B256>,
    cancelled: bool,
}

/// Grouped parallel executor over a [`PlainTransactionExecutor`].
pub struct ParallelTransactionExecutingService<E> {
    grouper: Arc<TransactionGrouper>,
    plain_executor: Arc<E>,
    config: ExecutorConfig,
    reporter: Option<Arc<dyn ConflictReporter>>,
}

impl<E: PlainTransactionExecutor> ParallelTransactionExecutingService<E> {
    pub fn new(grouper: Arc<TransactionGrouper>, plain_executor: Arc<E>, config: ExecutorConfig) -> Self {
        Self {
            grouper,
            plain_executor,
            config,
            reporter: None,
        }
    }

    /// Sends a report whenever groups conflict.
    pub fn with_reporter(mut self, reporter: Arc<dyn ConflictReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Executes a block.
    ///
    /// For the same transactions and base state the final state equals that
    /// of plain sequential execution, under the convention that re-executed
    /// transactions apply after the accepted parallel ones.
    pub fn execute(
        &self,
        dto: &TransactionExecutingDto,
        cancel: &CancellationToken,
    ) -> Result<BlockExecutionResult, SchedulerError> {
        let start = Instant::now();
        let TransactionExecutingDto {
            block_header,
            transactions,
            partial_block_state_set,
            is_parallel,
            throw_on_failure,
        } = dto;
        let (is_parallel, throw_on_failure) = (*is_parallel, *throw_on_failure);
        let _span = info_span!(
            "execute_block",
            height = block_header.height,
            transactions = transactions.len(),
            parallel = is_parallel,
        )
        .entered();
        let base_state = partial_block_state_set.clone().unwrap_or_default();

        if !is_parallel {
            let outcome = self.execute_sequential(
                transactions,
                block_header,
                base_state,
                throw_on_failure,
                cancel,
            )?;
            return Ok(BlockExecutionResult {
                return_sets: outcome.return_sets,
                unexecuted: outcome.unexecuted,
                cancelled: outcome.cancelled,
                duration: start.elapsed(),
                ..Default::default()
            });
        }

        let ctx = ChainContext::for_block(block_header);
        let grouped = self.grouper.group(&ctx, transactions, cancel);
        grouped.validate(transactions)?;

        let mut result = BlockExecutionResult {
            group_count: grouped.parallelizables.len(),
            ..Default::default()
        };

        if cancel.is_cancelled() {
            result.cancelled = true;
            result.unexecuted = transactions.iter().map(Transaction::hash).collect();
            result.duration = start.elapsed();
            info!("cancelled before execution");
            return Ok(result);
        }

        let outcomes = self.execute_groups(&grouped.parallelizables, block_header, &base_state, cancel);
        let merged = merge_group_outcomes(&grouped.parallelizables, outcomes);

        if !merged.conflicting_sets.is_empty() {
            self.report_conflicts(&ctx, &merged);
        }

        result.conflicting = merged.retry.iter().map(Transaction::hash).collect();
        let updated_state = base_state.with_return_sets(&merged.accepted);
        result.return_sets = merged.accepted;

        let positions: HashMap<B256, TxnIndex> = transactions
            .iter()
            .enumerate()
            .map(|(idx, tx)| (tx.hash(), idx))
            .collect();
        let mut fallback: Vec<Transaction> = merged
            .retry
            .into_iter()
            .chain(grouped.non_parallelizables)
            .collect();
        fallback.sort_by_cached_key(|tx| positions.get(&tx.hash()).copied().unwrap_or(usize::MAX));

        if cancel.is_cancelled() || !merged.unexecuted.is_empty() {
            result.cancelled = true;
            result.unexecuted.extend(merged.unexecuted.iter().map(Transaction::hash));
            result.unexecuted.extend(fallback.iter().map(Transaction::hash));
        } else {
            let outcome = self.execute_sequential(
                &fallback,
                block_header,
                updated_state,
                throw_on_failure,
                cancel,
            )?;
            result.return_sets.extend(outcome.return_sets);
            result.unexecuted.extend(outcome.unexecuted);
            result.cancelled |= outcome.cancelled;
        }

        result.return_sets.extend(
            grouped
                .without_contract
                .iter()
                .map(|tx| ExecutionReturnSet::failed(tx.hash(), INVALID_CONTRACT_ADDRESS)),
        );
        result.duration = start.elapsed();

        info!(
            groups = result.group_count,
            return_sets = result.return_sets.len(),
            conflicting = result.conflicting.len(),
            sequential = fallback.len(),
            without_contract = grouped.without_contract.len(),
            cancelled = result.cancelled,
            duration_ms = result.duration.as_millis() as u64,
            "block executed"
        );
        Ok(result)
    }

    /// Runs every group on the worker pool and collects one outcome per group.
    fn execute_groups(
        &self,
        groups: &[Vec<Transaction>],
        block_header: &BlockHeader,
        base_state: &BlockStateSet,
        cancel: &CancellationToken,
    ) -> Vec<GroupOutcome> {
        if groups.is_empty() {
            return Vec::new();
        }

        let scheduler = Scheduler::new(groups.len(), cancel.clone());
        let (sender, receiver) = channel::unbounded();
        let num_workers = self.config.num_threads.clamp(1, groups.len());

        thread::scope(|scope| {
            for worker_id in 0..num_workers {
                let sender = sender.clone();
                let scheduler = &scheduler;
                scope.spawn(move || {
                    self.worker_loop(
                        worker_id,
                        scheduler,
                        groups,
                        block_header,
                        base_state,
                        cancel,
                        sender,
                    )
                });
            }
        });
        drop(sender);

        let mut outcomes: Vec<GroupOutcome> =
            groups.iter().map(|_| GroupOutcome::Incomplete).collect();
        for (group_idx, outcome) in receiver.try_iter() {
            outcomes[group_idx] = outcome;
        }

        let stats = scheduler.stats();
        debug!(
            workers = num_workers,
            executed = stats.executed,
            faulted = stats.faulted,
            skipped = stats.skipped,
            "parallel groups finished"
        );
        outcomes
    }

    /// Worker thread main loop.
    #[allow(clippy::too_many_arguments)]
    fn worker_loop(
        &self,
        worker_id: usize,
        scheduler: &Scheduler,
        groups: &[Vec<Transaction>],
        block_header: &BlockHeader,
        base_state: &BlockStateSet,
        cancel: &CancellationToken,
        sender: Sender<(GroupIndex, GroupOutcome)>,
    ) {
        let mut local_executions = 0;

        loop {
            match scheduler.next_task() {
                Task::Execute(group_idx) => {
                    local_executions += 1;
                    let group = &groups[group_idx];
                    let _span = info_span!("group", worker_id, group_idx, transactions = group.len())
                        .entered();

                    let outcome = match run_guarded(
                        self.plain_executor.as_ref(),
                        group,
                        block_header,
                        base_state,
                        cancel,
                    ) {
                        Ok(return_sets) if return_sets.len() == group.len() => {
                            let accesses = group_accesses(&return_sets);
                            GroupOutcome::Executed {
                                return_sets,
                                accesses,
                            }
                        }
                        Ok(_) | Err(ExecutionError::Cancelled) if cancel.is_cancelled() => {
                            GroupOutcome::Incomplete
                        }
                        Ok(return_sets) => GroupOutcome::Faulted(format!(
                            "{} results for {} transactions",
                            return_sets.len(),
                            group.len()
                        )),
                        Err(err) => GroupOutcome::Faulted(err.to_string()),
                    };

                    if let GroupOutcome::Faulted(reason) = &outcome {
                        warn!(group_idx, %reason, "group faulted, scheduling sequentially");
                    }
                    scheduler.finish_execution(group_idx, !matches!(outcome, GroupOutcome::Executed { .. }));
                    if sender.send((group_idx, outcome)).is_err() {
                        break;
                    }
                }
                Task::Done => {
                    trace!(worker_id, local_executions, "worker done");
                    break;
                }
            }
        }
    }

    /// Executes `transactions` in order on top of `state`.
    ///
    /// A batch fault either fails the call (`throw_on_failure`) or falls back
    /// to one transaction at a time, turning each fault into a `Failed` set.
    fn execute_sequential(
        &self,
        transactions: &[Transaction],
        block_header: &BlockHeader,
        mut state: BlockStateSet,
        throw_on_failure: bool,
        cancel: &CancellationToken,
    ) -> Result<SequentialOutcome, SchedulerError> {
        let mut outcome = SequentialOutcome::default();
        if transactions.is_empty() {
            return Ok(outcome);
        }
        let _span = info_span!("sequential", transactions = transactions.len()).entered();

        let unexecuted_from = |outcome: &mut SequentialOutcome, from: usize| {
            outcome.cancelled = true;
            outcome
                .unexecuted
                .extend(transactions[from..].iter().map(Transaction::hash));
        };

        if cancel.is_cancelled() {
            unexecuted_from(&mut outcome, 0);
            return Ok(outcome);
        }

        match run_guarded(
            self.plain_executor.as_ref(),
            transactions,
            block_header,
            &state,
            cancel,
        ) {
            Ok(return_sets) => {
                let executed = return_sets.len().min(transactions.len());
                outcome.return_sets = return_sets;
                outcome.return_sets.truncate(executed);
                if executed < transactions.len() {
                    unexecuted_from(&mut outcome, executed);
                }
            }
            Err(ExecutionError::Cancelled) => unexecuted_from(&mut outcome, 0),
            Err(err) if throw_on_failure => {
                return Err(SchedulerError::SequentialExecution(err));
            }
            Err(err) => {
                warn!(%err, "sequential batch faulted, executing one at a time");
                for (idx, transaction) in transactions.iter().enumerate() {
                    if cancel.is_cancelled() {
                        unexecuted_from(&mut outcome, idx);
                        break;
                    }
                    match run_guarded(
                        self.plain_executor.as_ref(),
                        std::slice::from_ref(transaction),
                        block_header,
                        &state,
                        cancel,
                    ) {
                        Ok(mut sets) => match sets.pop() {
                            Some(set) => {
                                state.apply(&set);
                                outcome.return_sets.push(set);
                            }
                            None => {
                                unexecuted_from(&mut outcome, idx);
                                break;
                            }
                        },
                        Err(ExecutionError::Cancelled) => {
                            unexecuted_from(&mut outcome, idx);
                            break;
                        }
                        Err(err) => outcome
                            .return_sets
                            .push(ExecutionReturnSet::failed(transaction.hash(), err.to_string())),
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Reports groups rejected by the merge. Faulted groups carry no return
    /// sets to attribute, so they are re-executed but never reported and
    /// never lead to a remark.
    fn report_conflicts(&self, ctx: &ChainContext, merged: &MergeResult) {
        info!(
            conflicting = merged.conflicting_transactions.len(),
            accepted = merged.accepted.len(),
            "parallel groups conflicted"
        );
        let Some(reporter) = &self.reporter else {
            return;
        };
        reporter.report(ConflictingTransactionsFoundInParallelGroups {
            previous_block_hash: ctx.block_hash,
            previous_block_height: ctx.block_height,
            accepted_return_sets: merged.accepted.clone(),
            conflicting_return_sets: merged.conflicting_sets.clone(),
            conflicting_transactions: merged.conflicting_transactions.clone(),
        });
    }
}

/// Calls the plain executor, turning a panic into a fault.
fn run_guarded<E: PlainTransactionExecutor + ?Sized>(
    executor: &E,
    transactions: &[Transaction],
    block_header: &BlockHeader,
    base_state: &BlockStateSet,
    cancel: &CancellationToken,
) -> Result<Vec<ExecutionReturnSet>, ExecutionError> {
    panic::catch_unwind(AssertUnwindSafe(|| {
        executor.execute(transactions, block_header, base_state, cancel)
    }))
    .unwrap_or_else(|payload| Err(ExecutionError::Fault(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

fn group_accesses(return_sets: &[ExecutionReturnSet]) -> BTreeMap<StatePath, AccessType> {
    let mut accesses = BTreeMap::new();
    for (path, access) in return_sets.iter().flat_map(ExecutionReturnSet::accesses) {
        let entry = accesses.entry(path.clone()).or_insert(access);
        if access.is_write() {
            *entry = AccessType::Write;
        }
    }
    accesses
}

/// Merges group outcomes in group order. A group is accepted whole or not at all.
fn merge_group_outcomes(groups: &[Vec<Transaction>], outcomes: Vec<GroupOutcome>) -> MergeResult {
    let mut merged = MergeResult::default();
    let mut claims = KeyClaims::new();

    for (group_idx, (group, outcome)) in groups.iter().zip(outcomes).enumerate() {
        match outcome {
            GroupOutcome::Executed {
                return_sets,
                accesses,
            } => match claims.try_claim(group_idx, accesses.iter().map(|(path, access)| (path, *access))) {
                ClaimResult::Accepted => merged.accepted.extend(return_sets),
                ClaimResult::Conflict(paths) => {
                    debug!(group_idx, overlapping = paths.len(), "group conflicts with accepted groups");
                    merged.retry.extend(group.iter().cloned());
                    merged.conflicting_transactions.extend(group.iter().cloned());
                    merged
                        .conflicting_sets
                        .extend(return_sets.into_iter().map(|mut set| {
                            set.status = ExecutionStatus::Conflict;
                            set.error = Some(PARALLEL_CONFLICT.to_string());
                            set
                        }));
                }
            },
            // Retried, not reported.
            GroupOutcome::Faulted(_) => merged.retry.extend(group.iter().cloned()),
            GroupOutcome::Incomplete => merged.unexecuted.extend(group.iter().cloned()),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ConflictReportConsumer;
    use crate::grouper::GrouperConfig;
    use crate::remarks::ContractRemarksService;
    use crate::resource::ResourceExtractionService;
    use crate::testing::{contract, counter, tx, CounterExecutor, StaticChain};
    use alloy_primitives::Bytes;
    use std::sync::atomic::Ordering;

    struct Fixture {
        chain: Arc<StaticChain>,
        resources: Arc<ResourceExtractionService>,
        remarks: Arc<ContractRemarksService>,
        plain: Arc<CounterExecutor>,
        service: ParallelTransactionExecutingService<CounterExecutor>,
    }

    impl Fixture {
        fn new(num_threads: usize) -> Self {
            let chain = Arc::new(StaticChain::new());
            chain.deploy(contract(1), B256::repeat_byte(1));
            chain.deploy_misdeclared(contract(2), B256::repeat_byte(2));
            chain.deploy_opaque(contract(3), B256::repeat_byte(3));
            let resources = Arc::new(ResourceExtractionService::new(chain.clone()));
            let remarks = Arc::new(ContractRemarksService::new(chain.clone()));
            let grouper = Arc::new(TransactionGrouper::new(
                resources.clone(),
                remarks.clone(),
                GrouperConfig::default(),
            ));
            let plain = Arc::new(CounterExecutor::default());
            let service = ParallelTransactionExecutingService::new(
                grouper,
                plain.clone(),
                ExecutorConfig { num_threads },
            );
            Self {
                chain,
                resources,
                remarks,
                plain,
                service,
            }
        }

        fn header(&self) -> BlockHeader {
            BlockHeader::new(self.chain.genesis().block_hash, 1)
        }

        fn run(&self, transactions: Vec<Transaction>) -> BlockExecutionResult {
            self.service
                .execute(
                    &TransactionExecutingDto::new(self.header(), transactions),
                    &CancellationToken::new(),
                )
                .expect("execute")
        }

        /// Final state of running `transactions` through the plain executor alone.
        fn oracle(&self, transactions: &[Transaction]) -> BlockStateSet {
            let sets = CounterExecutor::default()
                .execute(transactions, &self.header(), &BlockStateSet::new(), &CancellationToken::new())
                .expect("oracle");
            BlockStateSet::new().with_return_sets(&sets)
        }
    }

    fn ids(transactions: &[Transaction]) -> Vec<B256> {
        transactions.iter().map(Transaction::hash).collect()
    }

    fn result_ids(result: &BlockExecutionResult) -> Vec<B256> {
        result.return_sets.iter().map(|set| set.transaction_id).collect()
    }

    fn path(contract_byte: u8, slot: &str) -> StatePath {
        StatePath::new(contract(contract_byte), [slot])
    }

    #[test]
    fn test_disjoint_block_runs_fully_parallel() {
        let fixture = Fixture::new(4);
        let txs = vec![tx(1, "add", &["a"]), tx(1, "add", &["b"]), tx(1, "add", &["c"])];

        let result = fixture.run(txs.clone());

        assert_eq!(result.group_count, 3);
        assert_eq!(result_ids(&result), ids(&txs));
        assert!(result.return_sets.iter().all(ExecutionReturnSet::is_mined));
        assert!(result.conflicting.is_empty());
        assert_eq!(result.block_state(BlockStateSet::new()), fixture.oracle(&txs));
    }

    #[test]
    fn test_shared_key_runs_in_one_group() {
        let fixture = Fixture::new(4);
        let txs = vec![tx(1, "add", &["a"]), tx(1, "read", &["a"])];

        let result = fixture.run(txs.clone());

        assert_eq!(result.group_count, 1);
        assert_eq!(result_ids(&result), ids(&txs));
        assert!(result.conflicting.is_empty());
    }

    #[test]
    fn test_misprediction_is_reexecuted_and_reported() {
        let fixture = Fixture::new(4);
        let handler = crate::events::ConflictReportHandler::new(
            Arc::new(crate::conflict::ConflictingTransactionIdentificationService::new(
                fixture.resources.clone(),
            )),
            fixture.resources.clone(),
            fixture.remarks.clone(),
        );
        let (sender, consumer) = ConflictReportConsumer::channel(handler);
        let Fixture {
            chain,
            remarks,
            service,
            ..
        } = fixture;
        let service = service.with_reporter(Arc::new(sender));

        let txs = vec![tx(2, "add", &["a"]), tx(2, "add", &["a"])];
        let header = BlockHeader::new(chain.genesis().block_hash, 1);
        let result = service
            .execute(
                &TransactionExecutingDto::new(header.clone(), txs.clone()),
                &CancellationToken::new(),
            )
            .expect("execute");

        assert_eq!(result.group_count, 2);
        assert_eq!(result.conflicting, vec![txs[1].hash()]);
        assert_eq!(result_ids(&result), ids(&txs));
        assert!(result.return_sets.iter().all(ExecutionReturnSet::is_mined));
        let state = result.block_state(BlockStateSet::new());
        assert_eq!(counter(&state, &path(2, "a")), 2);

        assert_eq!(consumer.drain(), 1);
        let ctx = chain.genesis();
        assert!(remarks.is_marked(&ctx, &contract(2)));

        // The next block on the same branch schedules the contract sequentially.
        let txs = vec![tx(2, "add", &["a"]), tx(2, "add", &["a"])];
        let result = service
            .execute(&TransactionExecutingDto::new(header, txs), &CancellationToken::new())
            .expect("execute");
        assert_eq!(result.group_count, 0);
        assert!(result.conflicting.is_empty());
        assert_eq!(consumer.drain(), 0);
    }

    #[test]
    fn test_without_contract_is_failed_last() {
        let fixture = Fixture::new(2);
        let missing = tx(9, "add", &["a"]);
        let txs = vec![missing.clone(), tx(1, "add", &["a"]), tx(3, "add", &["b"])];

        let result = fixture.run(txs.clone());

        assert_eq!(result_ids(&result), vec![txs[1].hash(), txs[2].hash(), missing.hash()]);
        let last = &result.return_sets[2];
        assert_eq!(last.status, ExecutionStatus::Failed);
        assert_eq!(last.error.as_deref(), Some(INVALID_CONTRACT_ADDRESS));
        assert!(last.state_changes.is_empty());
    }

    #[test]
    fn test_sequential_results_follow_block_order() {
        let fixture = Fixture::new(2);
        let txs = vec![
            tx(3, "add", &["z"]),
            tx(1, "add", &["a"]),
            tx(3, "add", &["y"]),
        ];

        let result = fixture.run(txs.clone());

        assert_eq!(result_ids(&result), vec![txs[1].hash(), txs[0].hash(), txs[2].hash()]);
    }

    #[test]
    fn test_faulted_group_falls_back_to_sequential() {
        let fixture = Fixture::new(2);
        let txs = vec![tx(1, "add", &["a"]), tx(1, "abort", &["b"]), tx(1, "panic", &["c"])];

        let result = fixture.run(txs.clone());

        assert_eq!(result.group_count, 3);
        assert_eq!(result.conflicting, vec![txs[1].hash(), txs[2].hash()]);
        assert_eq!(result_ids(&result), ids(&txs));
        assert!(result.return_sets[0].is_mined());
        let abort = &result.return_sets[1];
        assert_eq!(abort.status, ExecutionStatus::Failed);
        assert_eq!(abort.error.as_deref(), Some("executor fault: abort"));
        let panicked = &result.return_sets[2];
        assert_eq!(panicked.status, ExecutionStatus::Failed);
        assert!(panicked.error.as_deref().is_some_and(|e| e.contains("panicked")));
    }

    #[test]
    fn test_throw_on_failure_aborts_call() {
        let fixture = Fixture::new(2);
        let txs = vec![tx(1, "add", &["a"]), tx(3, "abort", &["b"])];

        let err = fixture
            .service
            .execute(
                &TransactionExecutingDto::new(fixture.header(), txs).throw_on_failure(),
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert_eq!(
            err,
            SchedulerError::SequentialExecution(ExecutionError::Fault("abort".to_string()))
        );
    }

    #[test]
    fn test_partial_state_is_the_base() {
        let fixture = Fixture::new(2);
        let mut partial = BlockStateSet::new();
        partial
            .changes
            .insert(path(1, "a"), Bytes::from(41u64.to_be_bytes().to_vec()));
        let txs = vec![tx(1, "add", &["a"]), tx(3, "add", &["a"])];

        let result = fixture
            .service
            .execute(
                &TransactionExecutingDto::new(fixture.header(), txs).with_partial_state(partial.clone()),
                &CancellationToken::new(),
            )
            .expect("execute");

        let state = result.block_state(partial);
        assert_eq!(counter(&state, &path(1, "a")), 42);
        assert_eq!(counter(&state, &path(3, "a")), 1);
    }

    #[test]
    fn test_non_parallel_mode_executes_in_block_order() {
        let fixture = Fixture::new(4);
        let txs = vec![tx(1, "add", &["a"]), tx(9, "add", &["a"]), tx(1, "add", &["b"])];

        let result = fixture
            .service
            .execute(
                &TransactionExecutingDto::new(fixture.header(), txs.clone()).sequential(),
                &CancellationToken::new(),
            )
            .expect("execute");

        assert_eq!(result_ids(&result), ids(&txs));
        assert_eq!(result.group_count, 0);
        assert_eq!(fixture.plain.batches.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_cancelled_before_start_executes_nothing() {
        let fixture = Fixture::new(2);
        let txs = vec![tx(1, "add", &["a"]), tx(3, "add", &["b"])];
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = fixture
            .service
            .execute(&TransactionExecutingDto::new(fixture.header(), txs.clone()), &cancel)
            .expect("execute");

        assert!(result.cancelled);
        assert!(result.return_sets.is_empty());
        assert_eq!(result.unexecuted, ids(&txs));
        assert_eq!(fixture.plain.batches.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_cancellation_mid_block_discards_incomplete_groups() {
        let fixture = Fixture::new(1);
        let txs = vec![
            tx(1, "add", &["a"]),
            tx(1, "cancel", &["b"]),
            tx(1, "add", &["c"]),
            tx(3, "add", &["d"]),
        ];

        let result = fixture.run(txs.clone());

        assert!(result.cancelled);
        assert_eq!(result_ids(&result), vec![txs[0].hash()]);
        let mut unexecuted = result.unexecuted.clone();
        unexecuted.sort();
        let mut expected = ids(&txs[1..]);
        expected.sort();
        assert_eq!(unexecuted, expected);
    }

    #[test]
    fn test_merge_rejects_later_overlapping_group() {
        let first = tx(1, "add", &["a"]);
        let second = tx(1, "read", &["a"]);
        let groups = vec![vec![first.clone()], vec![second.clone()]];

        let mut written = ExecutionReturnSet::mined(first.hash());
        written
            .state_changes
            .insert(path(1, "a"), Bytes::from_static(b"1"));
        let mut read = ExecutionReturnSet::mined(second.hash());
        read.state_accesses.insert(path(1, "a"));

        let outcomes = vec![
            GroupOutcome::Executed {
                accesses: group_accesses(std::slice::from_ref(&written)),
                return_sets: vec![written],
            },
            GroupOutcome::Executed {
                accesses: group_accesses(std::slice::from_ref(&read)),
                return_sets: vec![read],
            },
        ];
        let merged = merge_group_outcomes(&groups, outcomes);

        assert_eq!(merged.accepted.len(), 1);
        assert_eq!(merged.retry, vec![second]);
        assert_eq!(merged.conflicting_sets[0].status, ExecutionStatus::Conflict);
        assert_eq!(merged.conflicting_sets[0].error.as_deref(), Some(PARALLEL_CONFLICT));
    }

    #[test]
    fn test_faulted_group_is_retried_without_report() {
        let fixture = Fixture::new(2);
        let handler = crate::events::ConflictReportHandler::new(
            Arc::new(crate::conflict::ConflictingTransactionIdentificationService::new(
                fixture.resources.clone(),
            )),
            fixture.resources.clone(),
            fixture.remarks.clone(),
        );
        let (sender, consumer) = ConflictReportConsumer::channel(handler);
        let Fixture {
            chain,
            remarks,
            service,
            ..
        } = fixture;
        let service = service.with_reporter(Arc::new(sender));

        let txs = vec![tx(1, "add", &["a"]), tx(1, "abort", &["b"])];
        let header = BlockHeader::new(chain.genesis().block_hash, 1);
        let result = service
            .execute(&TransactionExecutingDto::new(header, txs.clone()), &CancellationToken::new())
            .expect("execute");

        assert_eq!(result.conflicting, vec![txs[1].hash()]);
        assert_eq!(result.return_sets[1].status, ExecutionStatus::Failed);
        assert_eq!(consumer.drain(), 0);
        assert!(!remarks.is_marked(&chain.genesis(), &contract(1)));
    }

    #[test]
    fn test_cancellation_is_not_fatal_under_throw_on_failure() {
        let fixture = Fixture::new(2);
        let txs = vec![tx(1, "add", &["a"]), tx(1, "interrupt", &["b"])];
        let cancel = CancellationToken::new();

        let result = fixture
            .service
            .execute(
                &TransactionExecutingDto::new(fixture.header(), txs.clone())
                    .sequential()
                    .throw_on_failure(),
                &cancel,
            )
            .expect("cancellation is a clean result");

        assert!(result.cancelled);
        assert!(result.return_sets.is_empty());
        assert_eq!(result.unexecuted, ids(&txs));
    }
}
