//! Counter contract interpreter.
//!
//! Every state change is a wrapping increment, so any serial order of the same
//! calls ends in the same counters. That makes the sequential oracle a valid
//! reference for the grouped executor's fallback ordering.

use crate::contracts::{ContractRegistry, CounterCall};
use alloy_primitives::{Bloom, Bytes};
use group_executor::{
    BlockHeader, BlockStateSet, ExecutionError, ExecutionReturnSet, PlainTransactionExecutor,
    StatePath, Transaction, INVALID_CONTRACT_ADDRESS,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Reads a counter, treating absent, deleted and malformed values as 0.
pub fn read_counter(state: &BlockStateSet, path: &StatePath) -> u64 {
    match state.get(path) {
        Some(Some(value)) => <[u8; 8]>::try_from(value.as_ref())
            .map(u64::from_be_bytes)
            .unwrap_or_default(),
        _ => 0,
    }
}

pub fn encode_counter(value: u64) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

/// Plain executor for counter contracts.
///
/// Methods: `add` increments each slot, `read` reads them, `fail` produces a
/// failed result, `abort` faults the whole batch. Anything else fails.
#[derive(Debug, Clone)]
pub struct CounterVm {
    registry: Arc<ContractRegistry>,
}

impl CounterVm {
    pub fn new(registry: Arc<ContractRegistry>) -> Self {
        Self { registry }
    }

    fn execute_one(
        &self,
        transaction: &Transaction,
        state: &BlockStateSet,
    ) -> Result<ExecutionReturnSet, ExecutionError> {
        let transaction_id = transaction.hash();
        if self.registry.kind(&transaction.to).is_none() {
            return Ok(ExecutionReturnSet::failed(
                transaction_id,
                INVALID_CONTRACT_ADDRESS,
            ));
        }
        let call = match CounterCall::decode(&transaction.params) {
            Ok(call) => call,
            Err(err) => return Ok(ExecutionReturnSet::failed(transaction_id, err.to_string())),
        };
        let paths = call.paths(transaction.to);

        let mut set = ExecutionReturnSet::mined(transaction_id);
        match transaction.method_name.as_str() {
            "add" => {
                for path in paths {
                    let value = read_counter(state, &path).wrapping_add(1);
                    set.state_changes.insert(path.clone(), encode_counter(value));
                    set.state_accesses.insert(path);
                }
                let mut bloom = Bloom::default();
                bloom.accrue_raw_log(transaction.to, &[]);
                set.bloom = bloom;
            }
            "read" => {
                let total = paths
                    .iter()
                    .fold(0u64, |acc, path| acc.wrapping_add(read_counter(state, path)));
                set.return_value = encode_counter(total);
                set.state_accesses.extend(paths);
            }
            "fail" => {
                set = ExecutionReturnSet::failed(transaction_id, "call failed");
                set.state_accesses.extend(paths);
            }
            "abort" => {
                return Err(ExecutionError::Fault(format!(
                    "aborted in transaction {transaction_id}"
                )))
            }
            method => {
                set = ExecutionReturnSet::failed(transaction_id, format!("unknown method {method}"));
            }
        }
        Ok(set)
    }
}

impl PlainTransactionExecutor for CounterVm {
    fn execute(
        &self,
        transactions: &[Transaction],
        _block_header: &BlockHeader,
        base_state: &BlockStateSet,
        cancel: &CancellationToken,
    ) -> Result<Vec<ExecutionReturnSet>, ExecutionError> {
        let mut state = base_state.clone();
        let mut return_sets = Vec::with_capacity(transactions.len());
        for transaction in transactions {
            if cancel.is_cancelled() {
                trace!(executed = return_sets.len(), "counter vm cancelled");
                break;
            }
            let set = self.execute_one(transaction, &state)?;
            state.apply(&set);
            return_sets.push(set);
        }
        Ok(return_sets)
    }
}
