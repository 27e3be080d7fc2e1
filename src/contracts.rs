//! In-memory chain: deployed counter contracts and a block tree.
//!
//! Counter contracts keep `u64` counters under named slots. A call names the
//! slots it touches in its params, and each contract kind decides how honestly
//! it declares those slots to the scheduler.

use alloy_primitives::{keccak256, Address, Bytes, B256};
use group_executor::{
    BlockHeader, BlockIndex, ChainContext, ChainContextProvider, ResourceDeclaration,
    ResourceError, StatePath, Transaction,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

/// How a contract declares its resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContractKind {
    /// Declares exactly the slots each call touches.
    Declared,
    /// Declares every slot as read-only, even for `add`.
    Misdeclared,
    /// Does not declare resources.
    Opaque,
}

impl ContractKind {
    fn tag(self) -> u8 {
        match self {
            ContractKind::Declared => 0,
            ContractKind::Misdeclared => 1,
            ContractKind::Opaque => 2,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallDecodeError {
    #[error("call params truncated")]
    Truncated,
    #[error("slot name is not utf-8")]
    InvalidSlot,
}

/// Arguments of a counter call: a unique nonce and the slots it touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterCall {
    pub nonce: u64,
    pub slots: Vec<String>,
}

impl CounterCall {
    pub fn new(nonce: u64, slots: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            nonce,
            slots: slots.into_iter().map(Into::into).collect(),
        }
    }

    /// Encodes as `nonce (8) | count (2) | (len (2) | utf8)*`, big-endian.
    pub fn encode(&self) -> Bytes {
        let mut data = Vec::with_capacity(10 + self.slots.iter().map(|s| 2 + s.len()).sum::<usize>());
        data.extend_from_slice(&self.nonce.to_be_bytes());
        data.extend_from_slice(&(self.slots.len() as u16).to_be_bytes());
        for slot in &self.slots {
            data.extend_from_slice(&(slot.len() as u16).to_be_bytes());
            data.extend_from_slice(slot.as_bytes());
        }
        data.into()
    }

    pub fn decode(data: &[u8]) -> Result<Self, CallDecodeError> {
        let mut cursor = data;
        let nonce = u64::from_be_bytes(take::<8>(&mut cursor)?);
        let count = u16::from_be_bytes(take::<2>(&mut cursor)?);
        let mut slots = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = u16::from_be_bytes(take::<2>(&mut cursor)?) as usize;
            if cursor.len() < len {
                return Err(CallDecodeError::Truncated);
            }
            let (slot, rest) = cursor.split_at(len);
            slots.push(
                std::str::from_utf8(slot)
                    .map_err(|_| CallDecodeError::InvalidSlot)?
                    .to_string(),
            );
            cursor = rest;
        }
        Ok(Self { nonce, slots })
    }

    /// State paths of the call's slots under `contract`.
    pub fn paths(&self, contract: Address) -> Vec<StatePath> {
        self.slots
            .iter()
            .map(|slot| StatePath::new(contract, [slot.as_str()]))
            .collect()
    }
}

fn take<const N: usize>(cursor: &mut &[u8]) -> Result<[u8; N], CallDecodeError> {
    if cursor.len() < N {
        return Err(CallDecodeError::Truncated);
    }
    let (head, rest) = cursor.split_at(N);
    *cursor = rest;
    head.try_into().map_err(|_| CallDecodeError::Truncated)
}

#[derive(Debug, Clone, Copy)]
struct DeployedContract {
    code_hash: B256,
    kind: ContractKind,
}

/// Deployed contracts plus the block tree used for ancestry queries.
///
/// Contract state is not versioned by block: the registry answers with the
/// latest deployment regardless of context.
#[derive(Debug)]
pub struct ContractRegistry {
    contracts: RwLock<HashMap<Address, DeployedContract>>,
    /// Block hash to (height, parent hash).
    blocks: RwLock<HashMap<B256, (u64, Option<B256>)>>,
}

impl Default for ContractRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ContractRegistry {
    /// Creates a registry holding only the genesis block.
    pub fn new() -> Self {
        let mut blocks = HashMap::new();
        blocks.insert(B256::ZERO, (0, None));
        Self {
            contracts: RwLock::new(HashMap::new()),
            blocks: RwLock::new(blocks),
        }
    }

    pub fn genesis(&self) -> BlockIndex {
        BlockIndex::new(B256::ZERO, 0)
    }

    /// Deploys (or redeploys) a contract; the code hash changes with `kind`
    /// and with every redeployment.
    pub fn deploy(&self, address: Address, kind: ContractKind) -> B256 {
        let mut contracts = self.contracts.write();
        let previous = contracts
            .get(&address)
            .map(|contract| contract.code_hash)
            .unwrap_or_default();

        let mut data = Vec::with_capacity(20 + 1 + 32);
        data.extend_from_slice(address.as_slice());
        data.push(kind.tag());
        data.extend_from_slice(previous.as_slice());
        let code_hash = keccak256(&data);

        contracts.insert(address, DeployedContract { code_hash, kind });
        code_hash
    }

    pub fn kind(&self, address: &Address) -> Option<ContractKind> {
        self.contracts.read().get(address).map(|contract| contract.kind)
    }

    /// Appends a block on top of `parent`.
    pub fn add_block(&self, parent: BlockIndex, hash: B256) -> BlockIndex {
        let height = parent.height + 1;
        self.blocks.write().insert(hash, (height, Some(parent.hash)));
        BlockIndex::new(hash, height)
    }

    /// Header for a block built on `parent`.
    pub fn header_on(&self, parent: BlockIndex) -> BlockHeader {
        BlockHeader::new(parent.hash, parent.height + 1)
    }
}

impl ChainContextProvider for ContractRegistry {
    fn contract_hash(&self, _ctx: &ChainContext, address: &Address) -> Option<B256> {
        self.contracts
            .read()
            .get(address)
            .map(|contract| contract.code_hash)
    }

    fn declared_resources(
        &self,
        _ctx: &ChainContext,
        transaction: &Transaction,
    ) -> Result<Option<ResourceDeclaration>, ResourceError> {
        let kind = self
            .kind(&transaction.to)
            .ok_or(ResourceError::MetadataUnavailable(transaction.to))?;
        if kind == ContractKind::Opaque {
            return Ok(None);
        }

        let call = CounterCall::decode(&transaction.params).map_err(|err| {
            ResourceError::Malformed {
                transaction_id: transaction.hash(),
                reason: err.to_string(),
            }
        })?;
        let paths = call.paths(transaction.to);

        let mut declaration = ResourceDeclaration::default();
        match (kind, transaction.method_name.as_str()) {
            (ContractKind::Declared, "add") => declaration.write_paths.extend(paths),
            _ => declaration.read_paths.extend(paths),
        }
        Ok(Some(declaration))
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
