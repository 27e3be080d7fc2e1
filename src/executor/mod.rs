//! Block execution strategies.
//!
//! This module provides the [`Executor`] trait and implementations for
//! different block execution strategies.

mod grouped;
mod sequential;

pub use grouped::{GroupedExecutorConfig, GroupedParallelExecutor};
pub use sequential::SequentialExecutor;

use crate::Workload;
use group_executor::{BlockStateSet, ExecutionReturnSet};

/// Order in which an executor reports return sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderingMode {
    /// Return sets are re-sorted into block order.
    #[default]
    Strict,

    /// Return sets are reported in the order they were applied: accepted
    /// parallel results first, then the sequential fallback.
    ///
    /// Note: Sequential executors ignore this flag as they naturally maintain strict ordering.
    Loose,
}

impl OrderingMode {
    /// Returns true if strict ordering is required.
    pub fn is_strict(&self) -> bool {
        matches!(self, OrderingMode::Strict)
    }
}

/// Result of executing a workload.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    /// Number of `Mined` transactions.
    pub successful: usize,
    /// Number of `Failed` transactions.
    pub failed: usize,
    /// Number of parallel groups (0 for sequential execution).
    pub groups: usize,
    /// Number of transactions re-executed after a parallel conflict or fault.
    pub conflicting: usize,
    /// One return set per executed transaction.
    pub return_sets: Vec<ExecutionReturnSet>,
}

impl ExecutionResult {
    /// Counts outcomes of `return_sets`.
    pub fn from_return_sets(return_sets: Vec<ExecutionReturnSet>) -> Self {
        let successful = return_sets.iter().filter(|set| set.is_mined()).count();
        Self {
            successful,
            failed: return_sets.len() - successful,
            return_sets,
            ..Default::default()
        }
    }

    /// Total number of transactions processed.
    pub fn total(&self) -> usize {
        self.successful + self.failed
    }
}

/// Trait for different block execution strategies.
///
/// # Implementing a New Executor
///
/// ```
/// use group_exec_bench::executor::{ExecutionResult, Executor, SequentialExecutor};
/// use group_exec_bench::{Workload, WorkloadConfig};
/// use group_executor::BlockStateSet;
///
/// /// Runs only the first half of the block.
/// pub struct FirstHalf(SequentialExecutor);
///
/// impl Executor for FirstHalf {
///     fn execute(
///         &self,
///         state: BlockStateSet,
///         workload: &Workload,
///     ) -> (BlockStateSet, ExecutionResult) {
///         let half = workload.transactions[..workload.transactions.len() / 2].to_vec();
///         let block = workload.with_transactions(workload.header.clone(), half);
///         self.0.execute(state, &block)
///     }
///
///     fn name(&self) -> &'static str {
///         "first_half"
///     }
/// }
///
/// let workload = Workload::generate(WorkloadConfig {
///     num_transactions: 10,
///     ..Default::default()
/// });
/// let (_, result) = FirstHalf(SequentialExecutor::new()).execute(workload.create_state(), &workload);
/// assert_eq!(result.total(), 5);
/// ```
pub trait Executor {
    /// Executes the workload's block on top of `state`.
    ///
    /// # Arguments
    /// * `state` - Partial block state the block starts from.
    /// * `workload` - The workload containing the block to execute.
    ///
    /// # Returns
    /// A tuple of (final state, execution result).
    fn execute(&self, state: BlockStateSet, workload: &Workload) -> (BlockStateSet, ExecutionResult);

    /// Returns whether return sets are reported in block order.
    fn preserves_order(&self) -> bool {
        true
    }

    /// Returns a human-readable name for this executor.
    fn name(&self) -> &'static str {
        "unknown"
    }
}
