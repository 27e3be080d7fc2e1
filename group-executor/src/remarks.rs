//! Fork-aware cache of contracts that must not be scheduled in parallel.
//!
//! A remark is created when a conflict is attributed to a contract. It is
//! scoped to the branch it was recorded on until block finalization either
//! prunes that branch (remark discarded) or makes the marking block
//! irreversible (remark becomes permanent and stops being fork-sensitive).

use crate::chain::{ChainContext, ChainContextProvider};
use crate::types::BlockIndex;
use alloy_primitives::{Address, B256};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// A contract marked non-parallelizable from `marked_at` onward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractRemark {
    pub contract_address: Address,
    /// Code the remark applies to; a code upgrade lifts it.
    pub code_hash: B256,
    pub marked_at: BlockIndex,
}

#[derive(Debug, Default)]
struct RemarkCache {
    /// Remarks whose marking block is irreversible, one per contract.
    permanent: HashMap<Address, ContractRemark>,
    /// Branch-scoped remarks.
    forks: HashMap<Address, Vec<ContractRemark>>,
}

/// Process-wide remark cache; concurrent reads, serialized writes.
pub struct ContractRemarksService {
    provider: Arc<dyn ChainContextProvider>,
    cache: RwLock<RemarkCache>,
}

impl ContractRemarksService {
    pub fn new(provider: Arc<dyn ChainContextProvider>) -> Self {
        Self {
            provider,
            cache: RwLock::new(RemarkCache::default()),
        }
    }

    /// Whether `address` carries a remark visible from `ctx`.
    pub fn is_marked(&self, ctx: &ChainContext, address: &Address) -> bool {
        self.get_remark(ctx, address).is_some()
    }

    /// The remark visible from `ctx` for `address`, preferring the most
    /// recent branch-scoped remark over the permanent one.
    pub fn get_remark(&self, ctx: &ChainContext, address: &Address) -> Option<ContractRemark> {
        let cache = self.cache.read();
        let on_branch = cache.forks.get(address).and_then(|remarks| {
            remarks
                .iter()
                .filter(|remark| self.is_on_branch(ctx, &remark.marked_at))
                .max_by_key(|remark| remark.marked_at.height)
        });
        on_branch
            .or_else(|| cache.permanent.get(address))
            .cloned()
    }

    /// Records a remark effective from `marked_at` onward along its branch.
    /// Recording the same remark twice is a no-op.
    pub fn set_remark(&self, contract_address: Address, code_hash: B256, marked_at: BlockIndex) {
        let mut cache = self.cache.write();
        if cache
            .permanent
            .get(&contract_address)
            .is_some_and(|remark| remark.code_hash == code_hash)
        {
            return;
        }

        let remarks = cache.forks.entry(contract_address).or_default();
        if remarks
            .iter()
            .any(|remark| remark.code_hash == code_hash && remark.marked_at == marked_at)
        {
            return;
        }
        remarks.push(ContractRemark {
            contract_address,
            code_hash,
            marked_at,
        });
        info!(%contract_address, %code_hash, %marked_at, "contract marked non-parallelizable");
    }

    /// Discards remarks recorded on pruned blocks.
    pub fn remove_fork_cache(&self, block_indexes: &[BlockIndex]) {
        let pruned: HashSet<&BlockIndex> = block_indexes.iter().collect();
        let mut cache = self.cache.write();
        let mut removed = 0;
        cache.forks.retain(|_, remarks| {
            let before = remarks.len();
            remarks.retain(|remark| !pruned.contains(&remark.marked_at));
            removed += before - remarks.len();
            !remarks.is_empty()
        });
        debug!(blocks = block_indexes.len(), removed, "pruned fork remarks");
    }

    /// Promotes remarks recorded on now-irreversible blocks to permanent ones.
    pub fn set_irreversible_cache(&self, block_indexes: &[BlockIndex]) {
        let irreversible: HashSet<&BlockIndex> = block_indexes.iter().collect();
        let mut cache = self.cache.write();
        let RemarkCache { permanent, forks } = &mut *cache;

        forks.retain(|address, remarks| {
            let (promoted, kept): (Vec<_>, Vec<_>) = std::mem::take(remarks)
                .into_iter()
                .partition(|remark| irreversible.contains(&remark.marked_at));
            if let Some(latest) = promoted
                .into_iter()
                .max_by_key(|remark| remark.marked_at.height)
            {
                debug!(contract_address = %address, marked_at = %latest.marked_at, "remark is now permanent");
                permanent.insert(*address, latest);
            }
            *remarks = kept;
            !remarks.is_empty()
        });
    }

    /// Number of branch-scoped remarks.
    pub fn fork_remark_count(&self) -> usize {
        self.cache.read().forks.values().map(Vec::len).sum()
    }

    /// Number of permanent remarks.
    pub fn permanent_remark_count(&self) -> usize {
        self.cache.read().permanent.len()
    }

    /// Whether `marked_at` is `ctx` itself or one of its ancestors.
    fn is_on_branch(&self, ctx: &ChainContext, marked_at: &BlockIndex) -> bool {
        if marked_at.height > ctx.block_height {
            return false;
        }
        if marked_at.height == ctx.block_height {
            return marked_at.hash == ctx.block_hash;
        }
        self.provider.ancestor_hash(ctx, marked_at.height) == Some(marked_at.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{contract, StaticChain};

    fn setup() -> (Arc<StaticChain>, ContractRemarksService) {
        let chain = Arc::new(StaticChain::new());
        let service = ContractRemarksService::new(chain.clone());
        (chain, service)
    }

    #[test]
    fn test_remark_visible_on_descendants_only() {
        let (chain, service) = setup();
        let genesis = chain.genesis().index();
        let a1 = chain.add_block(genesis, 0xa1);
        let a2 = chain.add_block(a1, 0xa2);
        let b1 = chain.add_block(genesis, 0xb1);

        service.set_remark(contract(1), B256::repeat_byte(1), a1);

        assert!(service.is_marked(&a1.into(), &contract(1)));
        assert!(service.is_marked(&a2.into(), &contract(1)));
        assert!(!service.is_marked(&b1.into(), &contract(1)));
        assert!(!service.is_marked(&genesis.into(), &contract(1)));
        assert!(!service.is_marked(&a2.into(), &contract(2)));
    }

    #[test]
    fn test_set_remark_is_idempotent() {
        let (chain, service) = setup();
        let a1 = chain.add_block(chain.genesis().index(), 0xa1);

        service.set_remark(contract(1), B256::repeat_byte(1), a1);
        service.set_remark(contract(1), B256::repeat_byte(1), a1);

        assert_eq!(service.fork_remark_count(), 1);
        assert!(service.is_marked(&a1.into(), &contract(1)));
    }

    #[test]
    fn test_remove_fork_cache_only_prunes_given_branches() {
        let (chain, service) = setup();
        let genesis = chain.genesis().index();
        let a1 = chain.add_block(genesis, 0xa1);
        let b1 = chain.add_block(genesis, 0xb1);

        service.set_remark(contract(1), B256::repeat_byte(1), a1);
        service.set_remark(contract(2), B256::repeat_byte(2), b1);

        service.remove_fork_cache(&[b1]);

        assert!(service.is_marked(&a1.into(), &contract(1)));
        assert!(!service.is_marked(&b1.into(), &contract(2)));
        assert_eq!(service.fork_remark_count(), 1);
    }

    #[test]
    fn test_irreversible_remark_becomes_permanent() {
        let (chain, service) = setup();
        let genesis = chain.genesis().index();
        let a1 = chain.add_block(genesis, 0xa1);
        let b1 = chain.add_block(genesis, 0xb1);

        service.set_remark(contract(1), B256::repeat_byte(1), a1);
        service.set_irreversible_cache(&[a1]);

        assert_eq!(service.fork_remark_count(), 0);
        assert_eq!(service.permanent_remark_count(), 1);
        // Permanent remarks are no longer fork-sensitive.
        assert!(service.is_marked(&b1.into(), &contract(1)));

        // Re-marking the same code is absorbed by the permanent entry.
        service.set_remark(contract(1), B256::repeat_byte(1), b1);
        assert_eq!(service.fork_remark_count(), 0);
    }

    #[test]
    fn test_newer_branch_remark_shadows_permanent() {
        let (chain, service) = setup();
        let genesis = chain.genesis().index();
        let a1 = chain.add_block(genesis, 0xa1);
        let a2 = chain.add_block(a1, 0xa2);

        service.set_remark(contract(1), B256::repeat_byte(1), a1);
        service.set_irreversible_cache(&[a1]);
        service.set_remark(contract(1), B256::repeat_byte(2), a2);

        let remark = service.get_remark(&a2.into(), &contract(1));
        assert_eq!(remark.map(|r| r.code_hash), Some(B256::repeat_byte(2)));
        let remark = service.get_remark(&a1.into(), &contract(1));
        assert_eq!(remark.map(|r| r.code_hash), Some(B256::repeat_byte(1)));
    }
}
