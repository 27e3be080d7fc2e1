//! Sequential block executor.
//!
//! This module provides the baseline executor: every transaction of the
//! block runs in block order through the counter VM. It is the reference the
//! grouped executor is checked against.

use super::{ExecutionResult, Executor};
use crate::vm::CounterVm;
use crate::Workload;
use group_executor::{
    BlockStateSet, ExecutionError, ExecutionReturnSet, PlainTransactionExecutor,
};
use std::slice;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Sequential executor that processes transactions one at a time.
///
/// A batch fault is retried one transaction at a time; a transaction whose
/// own execution faults is recorded as failed.
///
/// # Example
///
/// ```
/// use group_exec_bench::{Executor, SequentialExecutor, Workload, WorkloadConfig};
///
/// let workload = Workload::generate(WorkloadConfig::default());
/// let executor = SequentialExecutor::new();
/// let (_state, result) = executor.execute(workload.create_state(), &workload);
///
/// println!("Successful: {}, Failed: {}", result.successful, result.failed);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SequentialExecutor;

impl SequentialExecutor {
    /// Creates a new sequential executor.
    pub fn new() -> Self {
        Self
    }
}

impl Executor for SequentialExecutor {
    fn execute(&self, state: BlockStateSet, workload: &Workload) -> (BlockStateSet, ExecutionResult) {
        let vm = CounterVm::new(workload.registry.clone());
        let cancel = CancellationToken::new();

        let return_sets = match vm.execute(&workload.transactions, &workload.header, &state, &cancel) {
            Ok(return_sets) => return_sets,
            Err(err) => {
                debug!(%err, "batch faulted, executing one at a time");
                let mut current = state.clone();
                let mut return_sets = Vec::with_capacity(workload.transactions.len());
                for transaction in &workload.transactions {
                    let set = match vm.execute(slice::from_ref(transaction), &workload.header, &current, &cancel) {
                        Ok(mut sets) => sets.pop().unwrap_or_else(|| {
                            ExecutionReturnSet::failed(transaction.hash(), ExecutionError::Cancelled.to_string())
                        }),
                        Err(err) => ExecutionReturnSet::failed(transaction.hash(), err.to_string()),
                    };
                    current.apply(&set);
                    return_sets.push(set);
                }
                return_sets
            }
        };

        let final_state = state.with_return_sets(&return_sets);
        (final_state, ExecutionResult::from_return_sets(return_sets))
    }

    fn name(&self) -> &'static str {
        "sequential"
    }
}
