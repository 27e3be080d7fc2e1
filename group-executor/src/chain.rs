//! Chain context and the provider that answers historical queries against it.

use crate::errors::ResourceError;
use crate::types::{BlockHeader, BlockIndex, StatePath, Transaction};
use alloy_primitives::{Address, B256};
use std::collections::BTreeSet;

/// The block a computation is based on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainContext {
    pub block_hash: B256,
    pub block_height: u64,
}

impl ChainContext {
    pub fn new(block_hash: B256, block_height: u64) -> Self {
        Self {
            block_hash,
            block_height,
        }
    }

    /// Context for executing `header`: its parent block.
    pub fn for_block(header: &BlockHeader) -> Self {
        Self::from(header.parent_index())
    }

    pub fn index(&self) -> BlockIndex {
        BlockIndex::new(self.block_hash, self.block_height)
    }
}

impl From<BlockIndex> for ChainContext {
    fn from(index: BlockIndex) -> Self {
        Self::new(index.hash, index.height)
    }
}

/// Resource usage a contract declares for one call, without running it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceDeclaration {
    pub write_paths: BTreeSet<StatePath>,
    pub read_paths: BTreeSet<StatePath>,
    /// The contract itself says the call cannot be predicted.
    pub non_parallelizable: bool,
}

/// Read access to chain history needed by the scheduler.
///
/// Implementations must be deterministic for a given context: two nodes
/// asking the same question about the same block get the same answer.
pub trait ChainContextProvider: Send + Sync {
    /// Code hash of the contract deployed at `address`, or `None` when no
    /// contract lives there.
    fn contract_hash(&self, ctx: &ChainContext, address: &Address) -> Option<B256>;

    /// The call's declared resources, or `None` when the contract does not
    /// declare resources at all.
    fn declared_resources(
        &self,
        ctx: &ChainContext,
        transaction: &Transaction,
    ) -> Result<Option<ResourceDeclaration>, ResourceError>;

    /// Hash of the block at `height` on the branch ending at `ctx`.
    fn ancestor_hash(&self, ctx: &ChainContext, height: u64) -> Option<B256>;
}
