//! Claimed-key map for conflict detection over ground-truth accesses.
//!
//! Every owner (a group during the merge, a single return set during conflict
//! identification) claims the state paths it touched. Two claims on the same
//! path conflict iff they come from different owners and at least one of them
//! writes.

use crate::types::{AccessType, StatePath};
use std::collections::HashMap;

/// Identifier of whoever holds a claim.
pub type Owner = usize;

/// Claims held on a single path.
#[derive(Debug, Clone, Default)]
pub struct ClaimEntry {
    /// Owners that wrote the path.
    pub writers: Vec<Owner>,
    /// Owners that only read the path.
    pub readers: Vec<Owner>,
}

impl ClaimEntry {
    fn conflicts_with(&self, owner: Owner, access: AccessType) -> bool {
        let foreign_writer = self.writers.iter().any(|&w| w != owner);
        match access {
            AccessType::Read => foreign_writer,
            AccessType::Write => foreign_writer || self.readers.iter().any(|&r| r != owner),
        }
    }
}

/// Result of trying to claim a set of accesses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    /// No overlap, the accesses are now claimed.
    Accepted,
    /// The accesses overlap existing claims on these paths; nothing was claimed.
    Conflict(Vec<StatePath>),
}

/// Map from state path to the owners that claimed it.
#[derive(Debug, Default)]
pub struct KeyClaims {
    data: HashMap<StatePath, ClaimEntry>,
}

impl KeyClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a single access without checking for conflicts.
    pub fn record(&mut self, path: &StatePath, owner: Owner, access: AccessType) {
        let entry = self.data.entry(path.clone()).or_default();
        let owners = match access {
            AccessType::Read => &mut entry.readers,
            AccessType::Write => &mut entry.writers,
        };
        if !owners.contains(&owner) {
            owners.push(owner);
        }
    }

    /// Records every access of `owner` without checking for conflicts.
    pub fn record_all<'a>(
        &mut self,
        owner: Owner,
        accesses: impl IntoIterator<Item = (&'a StatePath, AccessType)>,
    ) {
        for (path, access) in accesses {
            self.record(path, owner, access);
        }
    }

    /// Paths on which `owner`'s accesses conflict with somebody else's claim.
    pub fn conflicts<'a>(
        &self,
        owner: Owner,
        accesses: impl IntoIterator<Item = (&'a StatePath, AccessType)>,
    ) -> Vec<StatePath> {
        accesses
            .into_iter()
            .filter(|(path, access)| {
                self.data
                    .get(*path)
                    .is_some_and(|entry| entry.conflicts_with(owner, *access))
            })
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Claims all accesses of `owner` if none of them conflicts; all-or-nothing.
    pub fn try_claim<'a>(
        &mut self,
        owner: Owner,
        accesses: impl IntoIterator<Item = (&'a StatePath, AccessType)>,
    ) -> ClaimResult {
        let accesses: Vec<_> = accesses.into_iter().collect();
        let overlapping = self.conflicts(owner, accesses.iter().copied());
        if !overlapping.is_empty() {
            return ClaimResult::Conflict(overlapping);
        }
        self.record_all(owner, accesses);
        ClaimResult::Accepted
    }

    /// Claims held on `path`.
    pub fn get(&self, path: &StatePath) -> Option<&ClaimEntry> {
        self.data.get(path)
    }

    /// Number of claimed paths.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
