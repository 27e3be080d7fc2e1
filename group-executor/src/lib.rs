//! Grouped parallel executor for blockchain transactions.
//!
//! This crate schedules the transactions of a block onto worker threads by
//! predicting which state each one touches. Transactions that are predicted
//! to share state run in the same group, in block order; disjoint groups run
//! concurrently. Predictions are never trusted: every group's actual reads
//! and writes are checked before its results are accepted, and anything that
//! cannot be accepted is re-executed sequentially.
//!
//! # Core Components
//!
//! - **ResourceExtractionService**: Predicts and caches per-transaction resources
//! - **TransactionGrouper**: Partitions a block into the connected components of its conflict graph
//! - **ParallelTransactionExecutingService**: Runs groups on a worker pool, merges and falls back
//! - **ConflictingTransactionIdentificationService**: Blames the transactions that mispredicted
//! - **ContractRemarksService**: Fork-aware cache of contracts forced to run sequentially
//!
//! # Algorithm Overview
//!
//! 1. Each transaction's contract declares the paths it will read and write
//! 2. Transactions sharing a written path are unioned into one group
//! 3. Groups execute in parallel against the same base state
//! 4. Groups are merged in order; one whose actual accesses overlap an accepted group is rejected
//! 5. Rejected and unpredictable transactions execute sequentially on top of the accepted state
//! 6. Rejections are reported, and contracts that lied are marked for later blocks on the branch
//!
//! # Example
//!
//! ```rust
//! use alloy_primitives::{Address, Bytes, B256};
//! use group_executor::{
//!     BlockHeader, BlockStateSet, ChainContext, ChainContextProvider, ContractRemarksService,
//!     ExecutionError, ExecutionReturnSet, ExecutorConfig, GrouperConfig,
//!     ParallelTransactionExecutingService, PlainTransactionExecutor, ResourceDeclaration,
//!     ResourceError, ResourceExtractionService, StatePath, Transaction, TransactionExecutingDto,
//!     TransactionGrouper,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! /// Every call writes one path named after its method.
//! struct Chain;
//!
//! impl ChainContextProvider for Chain {
//!     fn contract_hash(&self, _ctx: &ChainContext, address: &Address) -> Option<B256> {
//!         Some(B256::left_padding_from(address.as_slice()))
//!     }
//!
//!     fn declared_resources(
//!         &self,
//!         _ctx: &ChainContext,
//!         transaction: &Transaction,
//!     ) -> Result<Option<ResourceDeclaration>, ResourceError> {
//!         let mut declaration = ResourceDeclaration::default();
//!         declaration
//!             .write_paths
//!             .insert(StatePath::new(transaction.to, [transaction.method_name.as_str()]));
//!         Ok(Some(declaration))
//!     }
//!
//!     fn ancestor_hash(&self, _ctx: &ChainContext, _height: u64) -> Option<B256> {
//!         None
//!     }
//! }
//!
//! struct Vm;
//!
//! impl PlainTransactionExecutor for Vm {
//!     fn execute(
//!         &self,
//!         transactions: &[Transaction],
//!         _block_header: &BlockHeader,
//!         _base_state: &BlockStateSet,
//!         _cancel: &CancellationToken,
//!     ) -> Result<Vec<ExecutionReturnSet>, ExecutionError> {
//!         Ok(transactions
//!             .iter()
//!             .map(|transaction| {
//!                 let path = StatePath::new(transaction.to, [transaction.method_name.as_str()]);
//!                 let mut set = ExecutionReturnSet::mined(transaction.hash());
//!                 set.state_changes.insert(path.clone(), Bytes::from_static(b"\x01"));
//!                 set.state_accesses.insert(path);
//!                 set
//!             })
//!             .collect())
//!     }
//! }
//!
//! let chain = Arc::new(Chain);
//! let resources = Arc::new(ResourceExtractionService::new(chain.clone()));
//! let remarks = Arc::new(ContractRemarksService::new(chain));
//! let grouper = Arc::new(TransactionGrouper::new(resources, remarks, GrouperConfig::default()));
//! let service = ParallelTransactionExecutingService::new(grouper, Arc::new(Vm), ExecutorConfig::default());
//!
//! let transactions: Vec<Transaction> = ["a", "b", "c"]
//!     .into_iter()
//!     .map(|method| Transaction::new(Address::ZERO, Address::with_last_byte(1), method, Bytes::new()))
//!     .collect();
//! let header = BlockHeader::new(B256::ZERO, 1);
//!
//! let result = service.execute(
//!     &TransactionExecutingDto::new(header, transactions),
//!     &CancellationToken::new(),
//! )?;
//! assert_eq!(result.group_count, 3);
//! assert!(result.conflicting.is_empty());
//! # Ok::<(), group_executor::SchedulerError>(())
//! ```

pub mod chain;
pub mod claims;
pub mod conflict;
pub mod errors;
pub mod events;
pub mod executor;
pub mod grouper;
pub mod remarks;
pub mod resource;
pub mod scheduler;
pub mod types;

#[cfg(test)]
mod testing;

pub use chain::{ChainContext, ChainContextProvider, ResourceDeclaration};
pub use conflict::ConflictingTransactionIdentificationService;
pub use errors::{ExecutionError, ResourceError, SchedulerError};
pub use events::{
    ConflictReportConsumer, ConflictReportHandler, ConflictReporter,
    ConflictingTransactionsFoundInParallelGroups, FinalizationEvent, FinalizationEventHandler,
};
pub use executor::{
    BlockExecutionResult, ExecutorConfig, ParallelTransactionExecutingService,
    PlainTransactionExecutor, TransactionExecutingDto,
};
pub use grouper::{GroupStrategy, GrouperConfig, TransactionGrouper};
pub use remarks::{ContractRemark, ContractRemarksService};
pub use resource::ResourceExtractionService;
pub use types::{
    sort_by_block_order, AccessType, BlockHeader, BlockIndex, BlockStateSet, ExecutionReturnSet,
    ExecutionStatus, GroupIndex, GroupedTransactions, ParallelType, StatePath, Transaction,
    TransactionResourceInfo, TxnIndex, INVALID_CONTRACT_ADDRESS, PARALLEL_CONFLICT,
};
