//! Benchmarking and differential-testing harness for grouped parallel execution.
//!
//! This crate drives the `group-executor` scheduler with counter-contract
//! workloads and compares it against a plain sequential executor.
//!
//! # Architecture
//!
//! The framework is organized around three main concepts:
//!
//! - **Workload**: A deployed set of counter contracts and one block of calls on them
//! - **Executor**: A strategy for executing a block (sequential oracle, grouped parallel)
//! - **ContractRegistry**: The in-memory chain the scheduler predicts resources from
//!
//! # Quick Start
//!
//! ```
//! use group_exec_bench::{Executor, GroupedParallelExecutor, SequentialExecutor, Workload, WorkloadConfig};
//!
//! let workload = Workload::generate(WorkloadConfig {
//!     num_transactions: 50,
//!     ..Default::default()
//! });
//!
//! let (expected, _) = SequentialExecutor::new().execute(workload.create_state(), &workload);
//! let grouped = GroupedParallelExecutor::new(workload.registry.clone(), Default::default());
//! let (state, result) = grouped.execute(workload.create_state(), &workload);
//!
//! assert_eq!(state, expected);
//! println!("groups: {}, conflicting: {}", result.groups, result.conflicting);
//! ```

pub mod contracts;
pub mod executor;
pub mod vm;


pub use contracts::{ContractKind, ContractRegistry, CounterCall};
pub use executor::{
    ExecutionResult, Executor, GroupedExecutorConfig, GroupedParallelExecutor, OrderingMode,
    SequentialExecutor,
};
pub use vm::CounterVm;

use alloy_primitives::{keccak256, Address};
use group_executor::{BlockHeader, BlockStateSet, Transaction};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::Arc;

// ============================================================================
// Workload Configuration & Generation
// ============================================================================

/// Configuration for workload generation.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Number of deployed contracts.
    pub num_contracts: usize,
    /// Number of transactions in the block.
    pub num_transactions: usize,
    /// Distinct counter slots per contract.
    pub slots_per_contract: usize,
    /// Conflict factor: 0.0 = calls spread evenly, 1.0 = all calls hit one hot slot.
    pub conflict_factor: f64,
    /// Share of contracts that declare writes as reads.
    pub misdeclared_factor: f64,
    /// Share of contracts that declare nothing.
    pub opaque_factor: f64,
    /// Share of calls sent to an address without a contract.
    pub invalid_factor: f64,
    /// Share of `read` calls; the rest are `add`.
    pub read_factor: f64,
    /// Random seed for reproducibility.
    pub seed: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            num_contracts: 100,
            num_transactions: 100,
            slots_per_contract: 16,
            conflict_factor: 0.0,
            misdeclared_factor: 0.0,
            opaque_factor: 0.0,
            invalid_factor: 0.0,
            read_factor: 0.2,
            seed: 42,
        }
    }
}

/// A block of counter calls over freshly deployed contracts.
#[derive(Debug, Clone)]
pub struct Workload {
    /// Chain the contracts are deployed on.
    pub registry: Arc<ContractRegistry>,
    /// Deployed contract addresses.
    pub contracts: Vec<Address>,
    /// Header of the block, built on genesis.
    pub header: BlockHeader,
    /// The block's transactions in block order.
    pub transactions: Vec<Transaction>,
    /// The configuration used to generate this workload.
    pub config: WorkloadConfig,
}

/// Deterministic address for the `index`-th generated contract.
fn derive_address(seed: u64, index: u64) -> Address {
    let mut data = [0u8; 16];
    data[..8].copy_from_slice(&seed.to_be_bytes());
    data[8..].copy_from_slice(&index.to_be_bytes());
    Address::from_slice(&keccak256(data)[12..])
}

impl Workload {
    /// Generates a new workload from the given configuration.
    pub fn generate(config: WorkloadConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let registry = Arc::new(ContractRegistry::new());
        let num_contracts = config.num_contracts.max(1);
        let slots = config.slots_per_contract.max(1);

        let contracts: Vec<Address> = (0..num_contracts)
            .map(|i| {
                let address = derive_address(config.seed, i as u64);
                let roll = rng.gen::<f64>();
                let kind = if roll < config.misdeclared_factor {
                    ContractKind::Misdeclared
                } else if roll < config.misdeclared_factor + config.opaque_factor {
                    ContractKind::Opaque
                } else {
                    ContractKind::Declared
                };
                registry.deploy(address, kind);
                address
            })
            .collect();

        // Calculate "hot" contract range for conflict simulation.
        let hot_contract_count = if config.conflict_factor > 0.0 {
            (1.0 + (1.0 - config.conflict_factor) * (num_contracts as f64 - 1.0)).max(1.0) as usize
        } else {
            num_contracts
        };

        let transactions = (0..config.num_transactions)
            .map(|nonce| {
                let use_hot = rng.gen::<f64>() < config.conflict_factor;
                let (to, slot) = if rng.gen::<f64>() < config.invalid_factor {
                    (derive_address(!config.seed, nonce as u64), 0)
                } else if use_hot {
                    (contracts[rng.gen_range(0..hot_contract_count)], 0)
                } else {
                    (
                        contracts[rng.gen_range(0..num_contracts)],
                        rng.gen_range(0..slots),
                    )
                };
                let method = if rng.gen::<f64>() < config.read_factor {
                    "read"
                } else {
                    "add"
                };
                let call = CounterCall::new(nonce as u64, [format!("slot{slot}")]);
                Transaction::new(Address::ZERO, to, method, call.encode())
            })
            .collect();

        let header = registry.header_on(registry.genesis());
        Self {
            registry,
            contracts,
            header,
            transactions,
            config,
        }
    }

    /// Initial partial state of the block: empty, all counters at zero.
    pub fn create_state(&self) -> BlockStateSet {
        BlockStateSet::new()
    }

    /// The same contracts and chain with a different block of transactions.
    pub fn with_transactions(&self, header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            registry: self.registry.clone(),
            contracts: self.contracts.clone(),
            header,
            transactions,
            config: self.config.clone(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
