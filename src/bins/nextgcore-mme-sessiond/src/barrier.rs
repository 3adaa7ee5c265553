//! One-shot Barrier
//!
//! Joins a small set of named preconditions. Each precondition can be
//! satisfied once; the barrier fires when the last one is satisfied and is
//! never re-entered afterwards.

use std::collections::BTreeSet;
use std::fmt;

/// Result of satisfying a precondition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// Other preconditions are still outstanding
    Pending,
    /// This call completed the barrier; the gated action runs now
    Fired,
    /// The barrier fired earlier; nothing to do
    AlreadyFired,
    /// This precondition was satisfied before
    AlreadySatisfied,
    /// The precondition is not part of this barrier
    NotRequired,
}

impl fmt::Display for BarrierOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BarrierOutcome::Pending => write!(f, "PENDING"),
            BarrierOutcome::Fired => write!(f, "FIRED"),
            BarrierOutcome::AlreadyFired => write!(f, "ALREADY_FIRED"),
            BarrierOutcome::AlreadySatisfied => write!(f, "ALREADY_SATISFIED"),
            BarrierOutcome::NotRequired => write!(f, "NOT_REQUIRED"),
        }
    }
}

/// Barrier over preconditions of type `P`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Barrier<P: Ord> {
    required: BTreeSet<P>,
    satisfied: BTreeSet<P>,
    fired: bool,
}

impl<P: Ord + Copy + fmt::Debug> Barrier<P> {
    pub fn new(required: impl IntoIterator<Item = P>) -> Self {
        Self {
            required: required.into_iter().collect(),
            satisfied: BTreeSet::new(),
            fired: false,
        }
    }

    /// Add a precondition before anything has been satisfied
    pub fn require(&mut self, precondition: P) -> bool {
        if self.fired || !self.satisfied.is_empty() {
            return false;
        }
        self.required.insert(precondition)
    }

    pub fn is_required(&self, precondition: P) -> bool {
        self.required.contains(&precondition)
    }

    pub fn satisfy(&mut self, precondition: P) -> BarrierOutcome {
        if self.fired {
            return BarrierOutcome::AlreadyFired;
        }
        if !self.required.contains(&precondition) {
            return BarrierOutcome::NotRequired;
        }
        if !self.satisfied.insert(precondition) {
            return BarrierOutcome::AlreadySatisfied;
        }
        if self.satisfied.len() == self.required.len() {
            self.fired = true;
            log::debug!("barrier fired on {:?}", precondition);
            BarrierOutcome::Fired
        } else {
            BarrierOutcome::Pending
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    /// Preconditions still outstanding
    pub fn outstanding(&self) -> Vec<P> {
        self.required.difference(&self.satisfied).copied().collect()
    }
}
