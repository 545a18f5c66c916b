//! Primal/differential memo tables.
//!
//! Both tables are write-once per original instruction. Writing the same value
//! twice is harmless; writing a different one is reported to the caller, who
//! decides whether the conflict is recoverable (primal) or fatal (differential).

use crate::core::{TranscribeError, TranscribeResult};
use crate::ir::InstId;
use hashbrown::HashMap;

/// Outcome of a primal registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOutcome {
    Inserted,
    Unchanged,
    /// A different primal was already registered; it is kept.
    Conflict { existing: InstId },
}

#[derive(Debug, Default)]
pub struct InstMapping {
    primal: HashMap<InstId, (InstId, u64)>,
    differential: HashMap<InstId, (Option<InstId>, u64)>,
    clock: u64,
}

impl InstMapping {
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub fn map_primal(&mut self, orig: InstId, primal: InstId) -> MapOutcome {
        match self.primal.get(&orig) {
            Some(&(existing, _)) if existing == primal => MapOutcome::Unchanged,
            Some(&(existing, _)) => MapOutcome::Conflict { existing },
            None => {
                let order = self.tick();
                self.primal.insert(orig, (primal, order));
                MapOutcome::Inserted
            }
        }
    }

    pub fn map_differential(&mut self, orig: InstId, diff: Option<InstId>) -> TranscribeResult<()> {
        match self.differential.get(&orig) {
            Some(&(existing, _)) if existing == diff => Ok(()),
            Some(&(existing, _)) => Err(TranscribeError::InconsistentDifferential {
                inst: orig,
                existing,
                new: diff,
            }),
            None => {
                let order = self.tick();
                self.differential.insert(orig, (diff, order));
                Ok(())
            }
        }
    }

    pub fn has_primal(&self, orig: InstId) -> bool {
        self.primal.contains_key(&orig)
    }

    /// True once a differential (possibly "none") has been recorded.
    pub fn has_differential(&self, orig: InstId) -> bool {
        self.differential.contains_key(&orig)
    }

    pub fn lookup_primal(&self, orig: InstId, default: Option<InstId>) -> Option<InstId> {
        self.primal.get(&orig).map(|&(p, _)| p).or(default)
    }

    pub fn lookup_differential(&self, orig: InstId, default: Option<InstId>) -> Option<InstId> {
        match self.differential.get(&orig) {
            Some(&(diff, _)) => diff.or(default),
            None => default,
        }
    }

    /// Registration sequence number of the primal mapping.
    pub fn primal_order(&self, orig: InstId) -> Option<u64> {
        self.primal.get(&orig).map(|&(_, order)| order)
    }

    pub fn differential_order(&self, orig: InstId) -> Option<u64> {
        self.differential.get(&orig).map(|&(_, order)| order)
    }

    /// Originals with a recorded differential entry.
    pub fn differential_keys(&self) -> impl Iterator<Item = InstId> + '_ {
        self.differential.keys().copied()
    }
}
