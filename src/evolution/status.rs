//! Evolution status - what is recorded and what a run would do

use crate::evolution::error::BlockedRevision;
use crate::evolution::plan::Plan;
use crate::evolution::AppliedEvolution;
use serde::Serialize;

/// Snapshot of one namespace, computed without executing anything
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvolutionStatus {
    /// Recorded rows (from the meta table), ascending
    pub applied: Vec<AppliedEvolution>,

    /// The plan an evolve call would run; `None` while the namespace is blocked
    pub plan: Option<Plan>,

    /// Revisions blocking reconciliation, ascending
    pub inconsistent: Vec<BlockedRevision>,
}

impl EvolutionStatus {
    #[must_use]
    pub fn new(applied: Vec<AppliedEvolution>, plan: Option<Plan>, inconsistent: Vec<BlockedRevision>) -> Self {
        Self {
            applied,
            plan,
            inconsistent,
        }
    }

    /// Nothing to run and nothing blocked
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.inconsistent.is_empty() && self.plan.as_ref().map_or(true, Plan::is_empty)
    }

    /// Whether a manual fix is needed before the next run
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        !self.inconsistent.is_empty()
    }

    /// Number of scripts an evolve call would run
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.plan.as_ref().map_or(0, Plan::len)
    }

    /// Get the latest applied revision
    #[must_use]
    pub fn latest_applied_revision(&self) -> Option<u32> {
        self.applied.iter().map(|row| row.revision).max()
    }

    /// Get the next revision an evolve call would apply
    #[must_use]
    pub fn next_pending_revision(&self) -> Option<u32> {
        self.plan
            .as_ref()
            .and_then(|plan| plan.up_scripts.first())
            .map(|script| script.revision())
    }
}
