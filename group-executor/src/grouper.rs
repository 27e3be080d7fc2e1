//! Partitions a block into groups that are predicted to touch disjoint state.

use crate::chain::ChainContext;
use crate::errors::SchedulerError;
use crate::remarks::ContractRemarksService;
use crate::resource::ResourceExtractionService;
use crate::types::{
    GroupedTransactions, StatePath, Transaction, TransactionResourceInfo, TxnIndex,
};
use alloy_primitives::B256;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How connected components are rebalanced onto the available workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupStrategy {
    /// Every connected component is its own group.
    #[default]
    Naive,
    /// Repeatedly merge the two smallest groups until the target count is met.
    LimitedMinsAddUp,
    /// Fill each large group with the smallest ones up to `transactions / target`,
    /// then fold any excess groups into one.
    LimitedMaxAddMins,
}

/// Configuration for the grouper.
#[derive(Debug, Clone)]
pub struct GrouperConfig {
    /// Transactions beyond this many are scheduled sequentially. 0 = unlimited.
    pub max_transactions: usize,
    pub strategy: GroupStrategy,
    /// Group count the limited strategies rebalance down to.
    pub target_group_count: usize,
}

impl Default for GrouperConfig {
    fn default() -> Self {
        Self {
            max_transactions: 0,
            strategy: GroupStrategy::Naive,
            target_group_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

/// Union-find over arena indices.
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    fn find(&mut self, mut node: usize) -> usize {
        while self.parent[node] != node {
            self.parent[node] = self.parent[self.parent[node]];
            node = self.parent[node];
        }
        node
    }

    fn union(&mut self, a: usize, b: usize) {
        let (a, b) = (self.find(a), self.find(b));
        if a == b {
            return;
        }
        match self.rank[a].cmp(&self.rank[b]) {
            std::cmp::Ordering::Less => self.parent[a] = b,
            std::cmp::Ordering::Greater => self.parent[b] = a,
            std::cmp::Ordering::Equal => {
                self.parent[b] = a;
                self.rank[a] += 1;
            }
        }
    }
}

/// Groups transactions using predicted resources and the remark cache.
pub struct TransactionGrouper {
    resource_extraction: Arc<ResourceExtractionService>,
    remarks: Arc<ContractRemarksService>,
    config: GrouperConfig,
}

impl TransactionGrouper {
    pub fn new(
        resource_extraction: Arc<ResourceExtractionService>,
        remarks: Arc<ContractRemarksService>,
        config: GrouperConfig,
    ) -> Self {
        Self {
            resource_extraction,
            remarks,
            config,
        }
    }

    /// Partitions `transactions` for execution on top of `ctx`.
    ///
    /// Groups are ordered by their earliest transaction and keep the block's
    /// relative order inside; `non_parallelizables` and `without_contract`
    /// keep the block's relative order too.
    pub fn group(
        &self,
        ctx: &ChainContext,
        transactions: &[Transaction],
        cancel: &CancellationToken,
    ) -> GroupedTransactions {
        let limit = match self.config.max_transactions {
            0 => transactions.len(),
            max => max.min(transactions.len()),
        };
        let (to_group, overflow) = transactions.split_at(limit);
        let infos = self
            .resource_extraction
            .get_resource_infos(ctx, to_group, cancel);

        let mut without_contract = Vec::new();
        let mut non_parallelizables = Vec::new();
        let mut candidates = Vec::new();
        for (idx, (transaction, info)) in to_group.iter().zip(&infos).enumerate() {
            if info.is_invalid_contract_address() {
                without_contract.push(transaction.clone());
            } else if info.is_non_parallelizable() || self.is_remarked(ctx, transaction, info) {
                non_parallelizables.push(transaction.clone());
            } else {
                candidates.push(idx);
            }
        }
        non_parallelizables.extend_from_slice(overflow);

        let components = connected_components(&candidates, &infos);
        let groups = rebalance(components, &self.config);
        let parallelizables: Vec<Vec<Transaction>> = groups
            .into_iter()
            .map(|group| group.into_iter().map(|idx| to_group[idx].clone()).collect())
            .collect();

        info!(
            block_height = ctx.block_height + 1,
            transactions = transactions.len(),
            groups = parallelizables.len(),
            non_parallelizable = non_parallelizables.len(),
            without_contract = without_contract.len(),
            "grouped transactions"
        );

        GroupedTransactions {
            parallelizables,
            non_parallelizables,
            without_contract,
        }
    }

    fn is_remarked(
        &self,
        ctx: &ChainContext,
        transaction: &Transaction,
        info: &TransactionResourceInfo,
    ) -> bool {
        let remarked = self
            .remarks
            .get_remark(ctx, &transaction.to)
            .is_some_and(|remark| Some(remark.code_hash) == info.contract_hash);
        if remarked {
            debug!(transaction_id = %info.transaction_id, contract = %transaction.to, "forced non-parallelizable by remark");
        }
        remarked
    }
}

/// Connected components of the conflict graph over `candidates`.
///
/// Two transactions are connected iff they share a path that at least one
/// of them writes. Components come back ordered by their first member, each
/// in ascending transaction order.
fn connected_components(
    candidates: &[TxnIndex],
    infos: &[TransactionResourceInfo],
) -> Vec<Vec<TxnIndex>> {
    let written: HashSet<&StatePath> = candidates
        .iter()
        .flat_map(|&idx| infos[idx].write_paths.iter())
        .collect();

    let mut union_find = UnionFind::new(candidates.len());
    let mut first_toucher: HashMap<&StatePath, usize> = HashMap::new();
    for (node, &idx) in candidates.iter().enumerate() {
        for (path, access) in infos[idx].accesses() {
            // Paths nobody writes cannot conflict.
            if !access.is_write() && !written.contains(path) {
                continue;
            }
            match first_toucher.entry(path) {
                Entry::Occupied(entry) => union_find.union(node, *entry.get()),
                Entry::Vacant(entry) => {
                    entry.insert(node);
                }
            }
        }
    }

    let mut group_of_root: HashMap<usize, usize> = HashMap::new();
    let mut components: Vec<Vec<TxnIndex>> = Vec::new();
    for (node, &idx) in candidates.iter().enumerate() {
        let root = union_find.find(node);
        let group = *group_of_root.entry(root).or_insert_with(|| {
            components.push(Vec::new());
            components.len() - 1
        });
        components[group].push(idx);
    }
    components
}

/// Applies the configured strategy, then restores canonical ordering.
fn rebalance(groups: Vec<Vec<TxnIndex>>, config: &GrouperConfig) -> Vec<Vec<TxnIndex>> {
    let target = config.target_group_count;
    let mut groups = match config.strategy {
        _ if target == 0 || groups.len() <= target => groups,
        GroupStrategy::Naive => groups,
        GroupStrategy::LimitedMinsAddUp => mins_add_up(groups, target),
        GroupStrategy::LimitedMaxAddMins => max_add_mins(groups, target),
    };
    for group in &mut groups {
        group.sort_unstable();
    }
    groups.sort_by_key(|group| group.first().copied());
    groups
}

fn mins_add_up(mut groups: Vec<Vec<TxnIndex>>, target: usize) -> Vec<Vec<TxnIndex>> {
    groups.sort_by(|a, b| b.len().cmp(&a.len()));
    while groups.len() > target.max(1) {
        let (Some(min), Some(mut sub_min)) = (groups.pop(), groups.pop()) else {
            break;
        };
        sub_min.extend(min);
        let at = groups.partition_point(|group| group.len() >= sub_min.len());
        groups.insert(at, sub_min);
    }
    groups
}

fn max_add_mins(mut groups: Vec<Vec<TxnIndex>>, target: usize) -> Vec<Vec<TxnIndex>> {
    groups.sort_by(|a, b| b.len().cmp(&a.len()));
    let total: usize = groups.iter().map(Vec::len).sum();
    let threshold = total / target;

    let mut merged = Vec::new();
    let mut remaining: std::collections::VecDeque<_> = groups.into();
    while let Some(mut current) = remaining.pop_front() {
        while remaining
            .back()
            .is_some_and(|smallest| current.len() + smallest.len() <= threshold)
        {
            if let Some(smallest) = remaining.pop_back() {
                current.extend(smallest);
            }
        }
        merged.push(current);
    }

    if merged.len() <= target {
        return merged;
    }
    merged.sort_by_key(Vec::len);
    let excess = merged.len() - target + 1;
    let folded: Vec<TxnIndex> = merged.drain(..excess).flatten().collect();
    merged.insert(0, folded);
    merged
}

impl GroupedTransactions {
    /// Checks that the partitions contain exactly the block's transactions,
    /// each exactly once.
    pub fn validate(&self, transactions: &[Transaction]) -> Result<(), SchedulerError> {
        let mut balance: HashMap<B256, i64> = HashMap::new();
        for transaction in transactions {
            *balance.entry(transaction.hash()).or_default() -= 1;
        }
        for transaction in self.iter() {
            *balance.entry(transaction.hash()).or_default() += 1;
        }
        match balance.into_iter().find(|(_, count)| *count != 0) {
            Some((id, count)) => Err(SchedulerError::InvalidGrouping(id, count)),
            None => Ok(()),
        }
    }
}
