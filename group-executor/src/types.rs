//! Core types for grouped parallel execution.

use alloy_primitives::{keccak256, Address, Bloom, Bytes, B256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Transaction index in the block (0-based, original order).
pub type TxnIndex = usize;

/// Index of a group in [`GroupedTransactions::parallelizables`].
pub type GroupIndex = usize;

/// Error message attached to transactions whose target has no deployed contract.
pub const INVALID_CONTRACT_ADDRESS: &str = "invalid contract address";

/// Error message attached to return sets rejected during the parallel merge.
pub const PARALLEL_CONFLICT: &str = "Parallel conflict";

/// A single cell of contract state: the owning contract and a path inside it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatePath {
    pub address: Address,
    pub parts: Vec<String>,
}

impl StatePath {
    pub fn new<I, S>(address: Address, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            address,
            parts: parts.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.parts.join("/"))
    }
}

/// Read or write operation on a state path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    Read,
    Write,
}

impl AccessType {
    pub fn is_write(self) -> bool {
        matches!(self, AccessType::Write)
    }
}

/// An immutable transaction as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Transaction {
    pub from: Address,
    /// Target contract address.
    pub to: Address,
    pub method_name: String,
    /// Opaque, contract-specific call arguments.
    pub params: Bytes,
}

impl Transaction {
    pub fn new(from: Address, to: Address, method_name: impl Into<String>, params: Bytes) -> Self {
        Self {
            from,
            to,
            method_name: method_name.into(),
            params,
        }
    }

    /// Content hash of the transaction, used as its identity.
    pub fn hash(&self) -> B256 {
        let method = self.method_name.as_bytes();
        let mut data = Vec::with_capacity(20 + 20 + 4 + method.len() + self.params.len());
        data.extend_from_slice(self.from.as_slice());
        data.extend_from_slice(self.to.as_slice());
        data.extend_from_slice(&(method.len() as u32).to_be_bytes());
        data.extend_from_slice(method);
        data.extend_from_slice(&self.params);
        keccak256(&data)
    }
}

/// Hash and height of a block, the versioning key for fork-aware caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockIndex {
    pub hash: B256,
    pub height: u64,
}

impl BlockIndex {
    pub fn new(hash: B256, height: u64) -> Self {
        Self { hash, height }
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.height, self.hash)
    }
}

/// Header of the block being executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub previous_block_hash: B256,
    pub height: u64,
    /// Block timestamp in seconds, passed through to the plain executor.
    pub time: u64,
}

impl BlockHeader {
    pub fn new(previous_block_hash: B256, height: u64) -> Self {
        Self {
            previous_block_hash,
            height,
            time: 0,
        }
    }

    /// Index of the parent block this header builds on.
    pub fn parent_index(&self) -> BlockIndex {
        BlockIndex::new(self.previous_block_hash, self.height.saturating_sub(1))
    }

    /// Hash of the header itself.
    pub fn hash(&self) -> B256 {
        let mut data = [0u8; 48];
        data[..32].copy_from_slice(self.previous_block_hash.as_slice());
        data[32..40].copy_from_slice(&self.height.to_be_bytes());
        data[40..].copy_from_slice(&self.time.to_be_bytes());
        keccak256(data)
    }

    pub fn index(&self) -> BlockIndex {
        BlockIndex::new(self.hash(), self.height)
    }
}

/// Outcome of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    Mined,
    Failed,
    /// Rejected during the parallel merge; only ever seen in conflict reports.
    Conflict,
}

/// Result of executing one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReturnSet {
    pub transaction_id: B256,
    pub status: ExecutionStatus,
    pub state_changes: BTreeMap<StatePath, Bytes>,
    pub state_deletes: BTreeSet<StatePath>,
    /// Everything read or written during the actual run.
    pub state_accesses: BTreeSet<StatePath>,
    pub bloom: Bloom,
    pub return_value: Bytes,
    pub error: Option<String>,
}

impl ExecutionReturnSet {
    /// An empty `Mined` return set, to be filled by the executor.
    pub fn mined(transaction_id: B256) -> Self {
        Self {
            transaction_id,
            status: ExecutionStatus::Mined,
            state_changes: BTreeMap::new(),
            state_deletes: BTreeSet::new(),
            state_accesses: BTreeSet::new(),
            bloom: Bloom::default(),
            return_value: Bytes::new(),
            error: None,
        }
    }

    /// A `Failed` return set with no state effects.
    pub fn failed(transaction_id: B256, error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            error: Some(error.into()),
            ..Self::mined(transaction_id)
        }
    }

    pub fn is_mined(&self) -> bool {
        self.status == ExecutionStatus::Mined
    }

    /// Keys this transaction changed or deleted.
    pub fn write_keys(&self) -> impl Iterator<Item = &StatePath> {
        self.state_changes.keys().chain(self.state_deletes.iter())
    }

    /// Keys this transaction only read.
    pub fn read_keys(&self) -> impl Iterator<Item = &StatePath> {
        self.state_accesses.iter().filter(move |path| {
            !self.state_changes.contains_key(*path) && !self.state_deletes.contains(*path)
        })
    }

    /// Ground-truth accesses, writes taking precedence over reads.
    pub fn accesses(&self) -> impl Iterator<Item = (&StatePath, AccessType)> {
        self.write_keys()
            .map(|path| (path, AccessType::Write))
            .chain(self.read_keys().map(|path| (path, AccessType::Read)))
    }
}

/// Re-sorts return sets into the order their transactions appear in the block.
///
/// Return sets whose transaction is not in `transactions` are moved to the end.
pub fn sort_by_block_order(return_sets: &mut [ExecutionReturnSet], transactions: &[Transaction]) {
    let positions: HashMap<B256, TxnIndex> = transactions
        .iter()
        .enumerate()
        .map(|(idx, tx)| (tx.hash(), idx))
        .collect();
    return_sets.sort_by_key(|set| {
        positions
            .get(&set.transaction_id)
            .copied()
            .unwrap_or(usize::MAX)
    });
}

/// Partial block state: the in-memory delta on top of the parent block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockStateSet {
    pub changes: BTreeMap<StatePath, Bytes>,
    pub deletes: BTreeSet<StatePath>,
}

impl BlockStateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a path. `Some(None)` means the path was deleted in this delta,
    /// `None` means the delta does not know the path.
    pub fn get(&self, path: &StatePath) -> Option<Option<&Bytes>> {
        if let Some(value) = self.changes.get(path) {
            return Some(Some(value));
        }
        if self.deletes.contains(path) {
            return Some(None);
        }
        None
    }

    /// Applies one return set on top of this delta; later writes win.
    pub fn apply(&mut self, return_set: &ExecutionReturnSet) {
        for (path, value) in &return_set.state_changes {
            self.deletes.remove(path);
            self.changes.insert(path.clone(), value.clone());
        }
        for path in &return_set.state_deletes {
            self.changes.remove(path);
            self.deletes.insert(path.clone());
        }
    }

    /// Folds return sets on top of this delta in iteration order.
    pub fn with_return_sets<'a>(
        mut self,
        return_sets: impl IntoIterator<Item = &'a ExecutionReturnSet>,
    ) -> Self {
        for return_set in return_sets {
            self.apply(return_set);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.deletes.is_empty()
    }
}

/// How a transaction may be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParallelType {
    Parallelizable,
    NonParallelizable,
    InvalidContractAddress,
}

/// Predicted resource usage of one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResourceInfo {
    pub transaction_id: B256,
    pub write_paths: BTreeSet<StatePath>,
    pub read_paths: BTreeSet<StatePath>,
    /// Code hash of the target contract, if it resolved.
    pub contract_hash: Option<B256>,
    pub parallel_type: ParallelType,
}

impl TransactionResourceInfo {
    pub fn non_parallelizable(transaction_id: B256, contract_hash: Option<B256>) -> Self {
        Self {
            transaction_id,
            write_paths: BTreeSet::new(),
            read_paths: BTreeSet::new(),
            contract_hash,
            parallel_type: ParallelType::NonParallelizable,
        }
    }

    pub fn invalid_contract_address(transaction_id: B256) -> Self {
        Self {
            parallel_type: ParallelType::InvalidContractAddress,
            ..Self::non_parallelizable(transaction_id, None)
        }
    }

    pub fn is_non_parallelizable(&self) -> bool {
        self.parallel_type == ParallelType::NonParallelizable
    }

    pub fn is_invalid_contract_address(&self) -> bool {
        self.parallel_type == ParallelType::InvalidContractAddress
    }

    /// Predicted accesses, writes taking precedence over reads.
    pub fn accesses(&self) -> impl Iterator<Item = (&StatePath, AccessType)> {
        self.write_paths
            .iter()
            .map(|path| (path, AccessType::Write))
            .chain(
                self.read_paths
                    .iter()
                    .filter(move |path| !self.write_paths.contains(*path))
                    .map(|path| (path, AccessType::Read)),
            )
    }

    /// Whether the prediction accounts for everything the actual run touched.
    pub fn covers(&self, return_set: &ExecutionReturnSet) -> bool {
        return_set
            .write_keys()
            .all(|path| self.write_paths.contains(path))
            && return_set
                .read_keys()
                .all(|path| self.read_paths.contains(path) || self.write_paths.contains(path))
    }
}

/// A block's transactions partitioned for execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupedTransactions {
    /// Groups predicted to touch disjoint state.
    pub parallelizables: Vec<Vec<Transaction>>,
    /// Executed sequentially after the parallel phase.
    pub non_parallelizables: Vec<Transaction>,
    /// Transactions whose target has no deployed contract.
    pub without_contract: Vec<Transaction>,
}

impl GroupedTransactions {
    /// Total number of transactions across all partitions.
    pub fn len(&self) -> usize {
        self.parallelizables.iter().map(Vec::len).sum::<usize>()
            + self.non_parallelizables.len()
            + self.without_contract.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Groups flattened in group order, then non-parallelizables, then
    /// transactions without contract.
    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.parallelizables
            .iter()
            .flatten()
            .chain(self.non_parallelizables.iter())
            .chain(self.without_contract.iter())
    }
}
