//! Fixtures shared by the unit tests: an in-memory chain and a counter executor.

use crate::chain::{ChainContext, ChainContextProvider, ResourceDeclaration};
use crate::errors::{ExecutionError, ResourceError};
use crate::executor::PlainTransactionExecutor;
use crate::types::{BlockHeader, BlockIndex, BlockStateSet, ExecutionReturnSet, StatePath, Transaction};
use alloy_primitives::{Address, Bytes, B256};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

static SALT: AtomicU64 = AtomicU64::new(0);

pub(crate) fn contract(n: u8) -> Address {
    Address::with_last_byte(n)
}

/// A call on `contract(contract_byte)` touching `slots`. Every call is unique.
///
/// Methods understood by [`CounterExecutor`]: `add` increments each slot,
/// `read` reads them, `fail` returns a failed set, `abort` faults the batch,
/// `panic` panics, `cancel` fires the cancellation token.
pub(crate) fn tx(contract_byte: u8, method: &str, slots: &[&str]) -> Transaction {
    let salt = SALT.fetch_add(1, Ordering::Relaxed);
    let params = format!("{}|{}", slots.join(","), salt);
    Transaction::new(
        Address::with_last_byte(0xee),
        contract(contract_byte),
        method,
        Bytes::from(params.into_bytes()),
    )
}

pub(crate) fn slots(transaction: &Transaction) -> Vec<StatePath> {
    let params = String::from_utf8_lossy(&transaction.params);
    let slots = params.split('|').next().unwrap_or_default();
    slots
        .split(',')
        .filter(|slot| !slot.is_empty())
        .map(|slot| StatePath::new(transaction.to, [slot]))
        .collect()
}

/// Counter value at `path`, 0 when absent.
pub(crate) fn counter(state: &BlockStateSet, path: &StatePath) -> u64 {
    match state.get(path) {
        Some(Some(bytes)) => <[u8; 8]>::try_from(bytes.as_ref())
            .map(u64::from_be_bytes)
            .unwrap_or_default(),
        _ => 0,
    }
}

#[derive(Debug, Clone, Copy)]
enum Declares {
    /// Declares exactly what it touches.
    Truth,
    /// Declares nothing while still touching state.
    Nothing,
    /// Does not declare resources at all.
    Opaque,
    /// Metadata lookups fail.
    Broken,
}

/// In-memory chain with a block tree and deployed contracts.
pub(crate) struct StaticChain {
    contracts: RwLock<HashMap<Address, (B256, Declares)>>,
    /// Block hash to (height, parent hash).
    blocks: RwLock<HashMap<B256, (u64, Option<B256>)>>,
}

impl StaticChain {
    pub(crate) fn new() -> Self {
        let mut blocks = HashMap::new();
        blocks.insert(B256::ZERO, (0, None));
        Self {
            contracts: RwLock::new(HashMap::new()),
            blocks: RwLock::new(blocks),
        }
    }

    pub(crate) fn genesis(&self) -> ChainContext {
        ChainContext::new(B256::ZERO, 0)
    }

    pub(crate) fn add_block(&self, parent: BlockIndex, byte: u8) -> BlockIndex {
        let hash = B256::repeat_byte(byte);
        self.blocks
            .write()
            .insert(hash, (parent.height + 1, Some(parent.hash)));
        BlockIndex::new(hash, parent.height + 1)
    }

    pub(crate) fn deploy(&self, address: Address, code_hash: B256) {
        self.contracts
            .write()
            .insert(address, (code_hash, Declares::Truth));
    }

    pub(crate) fn deploy_misdeclared(&self, address: Address, code_hash: B256) {
        self.contracts
            .write()
            .insert(address, (code_hash, Declares::Nothing));
    }

    pub(crate) fn deploy_opaque(&self, address: Address, code_hash: B256) {
        self.contracts
            .write()
            .insert(address, (code_hash, Declares::Opaque));
    }

    pub(crate) fn deploy_broken(&self, address: Address, code_hash: B256) {
        self.contracts
            .write()
            .insert(address, (code_hash, Declares::Broken));
    }
}

impl ChainContextProvider for StaticChain {
    fn contract_hash(&self, _ctx: &ChainContext, address: &Address) -> Option<B256> {
        self.contracts.read().get(address).map(|(hash, _)| *hash)
    }

    fn declared_resources(
        &self,
        _ctx: &ChainContext,
        transaction: &Transaction,
    ) -> Result<Option<ResourceDeclaration>, ResourceError> {
        let declares = self
            .contracts
            .read()
            .get(&transaction.to)
            .map(|(_, declares)| *declares)
            .ok_or(ResourceError::MetadataUnavailable(transaction.to))?;

        match declares {
            Declares::Truth => {
                let mut declaration = ResourceDeclaration::default();
                let paths = slots(transaction).into_iter();
                match transaction.method_name.as_str() {
                    "add" => declaration.write_paths.extend(paths),
                    _ => declaration.read_paths.extend(paths),
                }
                Ok(Some(declaration))
            }
            Declares::Nothing => Ok(Some(ResourceDeclaration::default())),
            Declares::Opaque => Ok(None),
            Declares::Broken => Err(ResourceError::MetadataUnavailable(transaction.to)),
        }
    }

    fn ancestor_hash(&self, ctx: &ChainContext, height: u64) -> Option<B256> {
        let blocks = self.blocks.read();
        let mut hash = ctx.block_hash;
        loop {
            let (block_height, parent) = *blocks.get(&hash)?;
            if block_height == height {
                return Some(hash);
            }
            if block_height < height {
                return None;
            }
            hash = parent?;
        }
    }
}

/// Executes counter calls against an overlay of the base state.
#[derive(Default)]
pub(crate) struct CounterExecutor {
    pub(crate) batches: AtomicUsize,
}

impl PlainTransactionExecutor for CounterExecutor {
    fn execute(
        &self,
        transactions: &[Transaction],
        _block_header: &BlockHeader,
        base_state: &BlockStateSet,
        cancel: &CancellationToken,
    ) -> Result<Vec<ExecutionReturnSet>, ExecutionError> {
        self.batches.fetch_add(1, Ordering::Relaxed);
        let mut overlay = base_state.clone();
        let mut return_sets = Vec::with_capacity(transactions.len());

        for transaction in transactions {
            if cancel.is_cancelled() {
                break;
            }
            let mut set = ExecutionReturnSet::mined(transaction.hash());
            match transaction.method_name.as_str() {
                "add" => {
                    for path in slots(transaction) {
                        let value = counter(&overlay, &path).wrapping_add(1);
                        set.state_changes
                            .insert(path.clone(), Bytes::from(value.to_be_bytes().to_vec()));
                        set.state_accesses.insert(path);
                    }
                }
                "read" => set.state_accesses.extend(slots(transaction)),
                "fail" => set = ExecutionReturnSet::failed(transaction.hash(), "failed"),
                "abort" => return Err(ExecutionError::Fault("abort".to_string())),
                "panic" => panic!("counter executor panicked"),
                "cancel" => {
                    cancel.cancel();
                    break;
                }
                "interrupt" => {
                    cancel.cancel();
                    return Err(ExecutionError::Cancelled);
                }
                _ => set = ExecutionReturnSet::failed(transaction.hash(), "unknown method"),
            }
            overlay.apply(&set);
            return_sets.push(set);
        }
        Ok(return_sets)
    }
}
