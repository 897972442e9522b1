//! Reconciler - computes the down/up scripts that bring the recorded state in
//! line with the desired script set
//!
//! Downs run first, newest revision first, so a revision is always reverted
//! against the exact state it was applied on. Ups follow in ascending order.

use crate::evolution::checksum::{checksum_matches, is_checksum_format};
use crate::evolution::error::{BlockedRevision, EvolutionError};
use crate::evolution::state_store::Namespace;
use crate::evolution::{AppliedEvolution, Script};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Scripts to run, in order: all downs, then all ups
///
/// Computed fresh for every call; never cached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Plan {
    /// Recorded scripts to revert, revision descending
    pub down_scripts: Vec<Script>,
    /// Desired scripts to apply, revision ascending
    pub up_scripts: Vec<Script>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.down_scripts.is_empty() && self.up_scripts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.down_scripts.len() + self.up_scripts.len()
    }

    pub fn down_revisions(&self) -> Vec<u32> {
        self.down_scripts.iter().map(Script::revision).collect()
    }

    pub fn up_revisions(&self) -> Vec<u32> {
        self.up_scripts.iter().map(Script::revision).collect()
    }
}

/// Revisions that block automatic reconciliation, ascending
pub fn blocked_revisions(applied: &[AppliedEvolution]) -> Vec<BlockedRevision> {
    let mut blocked: Vec<BlockedRevision> = applied
        .iter()
        .filter(|row| row.state.is_blocking())
        .map(|row| BlockedRevision {
            revision: row.revision,
            state: row.state,
            problem: row.last_problem.clone(),
        })
        .collect();
    blocked.sort_by_key(|b| b.revision);
    blocked
}

/// Fail with `InconsistentState` if any recorded revision is unsettled
pub fn check_consistency(applied: &[AppliedEvolution]) -> Result<(), EvolutionError> {
    let blocked = blocked_revisions(applied);
    if blocked.is_empty() {
        Ok(())
    } else {
        Err(EvolutionError::InconsistentState { blocked })
    }
}

/// Fail with `Storage` if a recorded hash was not written by this engine
///
/// Such a table was filled by another tool. Every row would look changed and
/// be reverted, so nothing is planned against it.
pub fn check_recorded_hashes(
    applied: &[AppliedEvolution],
    namespace: &Namespace,
) -> Result<(), EvolutionError> {
    match applied.iter().find(|row| !is_checksum_format(&row.hash)) {
        Some(row) => Err(EvolutionError::Storage(format!(
            "meta table {namespace} holds revision {} with hash '{}' in an unknown format; \
             refusing to reconcile against it",
            row.revision,
            row.hash
        ))),
        None => Ok(()),
    }
}

/// Compute the plan reconciling `applied` with `desired`
///
/// - revisions whose stored hash no longer matches, or that are no longer
///   desired, are reverted with their recorded down script;
/// - desired revisions not applied after those removals are applied.
///
/// # Errors
///
/// Returns `InconsistentState` when any row is inconsistent or still applying.
pub fn reconcile(desired: &[Script], applied: &[AppliedEvolution]) -> Result<Plan, EvolutionError> {
    check_consistency(applied)?;

    let desired_by_revision: BTreeMap<u32, &Script> =
        desired.iter().map(|s| (s.revision(), s)).collect();

    let mut to_revert: Vec<&AppliedEvolution> = applied
        .iter()
        .filter(|row| match desired_by_revision.get(&row.revision) {
            Some(script) => !checksum_matches(&row.hash, &script.checksum()),
            None => true,
        })
        .collect();
    to_revert.sort_by(|a, b| b.revision.cmp(&a.revision));

    let reverted: BTreeSet<u32> = to_revert.iter().map(|row| row.revision).collect();
    let remaining: BTreeSet<u32> = applied
        .iter()
        .map(|row| row.revision)
        .filter(|revision| !reverted.contains(revision))
        .collect();

    let up_scripts: Vec<Script> = desired_by_revision
        .values()
        .filter(|script| !remaining.contains(&script.revision()))
        .map(|script| (*script).clone())
        .collect();

    Ok(Plan {
        down_scripts: to_revert.iter().map(|row| row.recorded_script()).collect(),
        up_scripts,
    })
}

/// Compute the plan reverting every recorded revision, newest first
///
/// # Errors
///
/// Returns `InconsistentState` when any row is inconsistent or still applying.
pub fn reset_plan(applied: &[AppliedEvolution]) -> Result<Plan, EvolutionError> {
    check_consistency(applied)?;

    let mut rows: Vec<&AppliedEvolution> = applied.iter().collect();
    rows.sort_by(|a, b| b.revision.cmp(&a.revision));

    Ok(Plan {
        down_scripts: rows.iter().map(|row| row.recorded_script()).collect(),
        up_scripts: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolution::{Direction, EvolutionState};

    fn script(revision: u32) -> Script {
        Script::new(
            revision,
            format!("CREATE TABLE t{revision} (id int);"),
            format!("DROP TABLE t{revision};"),
        )
    }

    fn applied(script: &Script) -> AppliedEvolution {
        AppliedEvolution::from_script(script, EvolutionState::Applied, None)
    }

    #[test]
    fn test_empty_store_applies_everything_ascending() {
        let desired = vec![script(1), script(2), script(3)];
        let plan = reconcile(&desired, &[]).unwrap();
        assert!(plan.down_scripts.is_empty());
        assert_eq!(plan.up_scripts, desired);
    }

    #[test]
    fn test_up_to_date_store_yields_empty_plan() {
        let desired = vec![script(1), script(2)];
        let rows: Vec<_> = desired.iter().map(applied).collect();
        assert!(reconcile(&desired, &rows).unwrap().is_empty());
    }

    #[test]
    fn test_only_new_revisions_are_applied() {
        let desired = vec![script(1), script(2), script(3)];
        let rows = vec![applied(&desired[0])];
        let plan = reconcile(&desired, &rows).unwrap();
        assert_eq!(plan.up_revisions(), vec![2, 3]);
        assert!(plan.down_scripts.is_empty());
    }

    #[test]
    fn test_changed_checksum_reverts_and_reapplies() {
        let old = vec![script(1), script(2)];
        let rows: Vec<_> = old.iter().map(applied).collect();

        let changed = Script::new(2, "CREATE TABLE t2 (id bigint);", "DROP TABLE t2;");
        let desired = vec![script(1), changed.clone()];

        let plan = reconcile(&desired, &rows).unwrap();
        assert_eq!(plan.down_revisions(), vec![2]);
        // revert with the recorded script, re-apply with the new one
        assert_eq!(plan.down_scripts[0], old[1]);
        assert_eq!(plan.up_scripts, vec![changed]);
    }

    #[test]
    fn test_removed_revisions_are_reverted_descending() {
        let old = vec![script(1), script(2), script(3)];
        let rows: Vec<_> = old.iter().map(applied).collect();

        let plan = reconcile(&[script(1)], &rows).unwrap();
        assert_eq!(plan.down_revisions(), vec![3, 2]);
        assert!(plan.up_scripts.is_empty());
    }

    #[test]
    fn test_inconsistent_row_blocks_plan() {
        let desired = vec![script(1), script(2), script(3)];
        let rows = vec![
            applied(&desired[0]),
            AppliedEvolution::from_script(
                &desired[1],
                EvolutionState::Inconsistent(Direction::Up),
                Some("boom".to_string()),
            ),
        ];

        let err = reconcile(&desired, &rows).unwrap_err();
        assert_eq!(err.blocked_revisions(), vec![2]);
    }

    #[test]
    fn test_stale_applying_row_blocks_plan() {
        let desired = vec![script(1)];
        let rows = vec![AppliedEvolution::from_script(
            &desired[0],
            EvolutionState::ApplyingUp,
            None,
        )];
        assert!(matches!(
            reconcile(&desired, &rows),
            Err(EvolutionError::InconsistentState { .. })
        ));
    }

    #[test]
    fn test_foreign_hash_format_is_rejected() {
        let mut row = applied(&script(1));
        assert!(check_recorded_hashes(&[row.clone()], &Namespace::default()).is_ok());

        row.hash = "da39a3ee5e6b4b0d3255bfef95601890afd80709".to_string();
        let err = check_recorded_hashes(&[row], &Namespace::default()).unwrap_err();
        match err {
            EvolutionError::Storage(message) => {
                assert!(message.contains("play_evolutions"));
                assert!(message.contains("revision 1"));
            }
            other => panic!("expected a storage error, got {other:?}"),
        }
    }

    #[test]
    fn test_reset_plan_reverts_everything_descending() {
        let rows: Vec<_> = [script(1), script(2), script(3)].iter().map(applied).collect();
        let plan = reset_plan(&rows).unwrap();
        assert_eq!(plan.down_revisions(), vec![3, 2, 1]);
        assert!(plan.up_scripts.is_empty());
    }
}
