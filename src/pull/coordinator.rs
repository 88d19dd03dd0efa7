//! Per-proposal mutual exclusion.
//!
//! Every mutating sequence (test, merge, update, retarget) holds the
//! proposal's slot for its whole duration. Different proposals never block
//! each other.
//!
//! The pool is in-process only. Two engine instances sharing a store are not
//! serialized against each other; deployments must run a single writer.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::types::ProposalId;

/// Exclusive slots keyed by proposal id.
#[derive(Debug, Default)]
pub struct Coordinator {
    held: Mutex<HashSet<ProposalId>>,
    released: Condvar,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `id` is free, then holds it until the guard drops.
    pub fn acquire(&self, id: ProposalId) -> ProposalGuard<'_> {
        let mut held = self.lock();
        while held.contains(&id) {
            tracing::trace!(proposal = %id, "waiting for proposal lock");
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(id);
        ProposalGuard {
            coordinator: self,
            id,
        }
    }

    /// Takes `id` only if nobody holds it.
    pub fn try_acquire(&self, id: ProposalId) -> Option<ProposalGuard<'_>> {
        let mut held = self.lock();
        if !held.insert(id) {
            return None;
        }
        Some(ProposalGuard {
            coordinator: self,
            id,
        })
    }

    pub fn is_held(&self, id: ProposalId) -> bool {
        self.lock().contains(&id)
    }

    // A panic while holding the set cannot leave it inconsistent: every
    // critical section is a single insert or remove.
    fn lock(&self) -> MutexGuard<'_, HashSet<ProposalId>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds a proposal's slot; releases it on drop, including during unwinding.
#[derive(Debug)]
pub struct ProposalGuard<'a> {
    coordinator: &'a Coordinator,
    id: ProposalId,
}

impl ProposalGuard<'_> {
    pub fn id(&self) -> ProposalId {
        self.id
    }
}

impl Drop for ProposalGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.lock().remove(&self.id);
        self.coordinator.released.notify_all();
    }
}
