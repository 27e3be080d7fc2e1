//! Error types for grouped execution.

use alloy_primitives::{Address, B256};
use thiserror::Error;

/// Failure raised by a plain transaction executor for a whole batch.
///
/// Per-transaction failures are not errors: they come back as `Failed`
/// return sets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The executor faulted and produced no usable result.
    #[error("executor fault: {0}")]
    Fault(String),
    /// Execution stopped because the cancellation token fired.
    #[error("execution cancelled")]
    Cancelled,
}

/// Failure while predicting the resources of a transaction.
///
/// Never fatal: the extraction service turns these into non-parallelizable infos.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("contract metadata unavailable for {0}")]
    MetadataUnavailable(Address),
    #[error("malformed resource declaration for transaction {transaction_id}: {reason}")]
    Malformed { transaction_id: B256, reason: String },
}

/// Errors that abort a whole block execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// Grouping lost, duplicated or invented a transaction.
    #[error("grouping is not a partition of the block: transaction {0} appears {1:+} times too often")]
    InvalidGrouping(B256, i64),
    /// Sequential execution faulted while `throw_on_failure` was set.
    #[error("sequential execution failed")]
    SequentialExecution(#[source] ExecutionError),
}
