//! Script runner - applies a reconciliation plan
//!
//! Downs run first, then ups, strictly in plan order. The first failing script
//! stops the run; its revision is recorded as inconsistent before the error
//! surfaces.

use crate::database::Connection;
use crate::evolution::error::EvolutionError;
use crate::evolution::plan::Plan;
use crate::evolution::state_store::StateStore;
use crate::evolution::statements::split_statements;
use crate::evolution::substitution::SubstitutionContext;
use crate::evolution::{Direction, Script};
use crate::transaction::Transaction;
use serde::Serialize;
use std::time::Instant;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Revisions handled by one run, in execution order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub reverted: Vec<u32>,
    pub applied: Vec<u32>,
}

impl ExecutionReport {
    pub fn is_empty(&self) -> bool {
        self.reverted.is_empty() && self.applied.is_empty()
    }

    fn record(&mut self, revision: u32, direction: Direction) {
        match direction {
            Direction::Up => self.applied.push(revision),
            Direction::Down => self.reverted.push(revision),
        }
    }
}

/// Why a single script did not complete
enum ScriptFailure {
    /// Bookkeeping failed; surfaces as-is
    Store(EvolutionError),
    /// The script itself failed; recorded as inconsistent
    Script(String),
}

/// Runs plans on one connection against one state store
pub struct ScriptRunner<'a> {
    connection: &'a dyn Connection,
    store: &'a dyn StateStore,
    substitutions: &'a SubstitutionContext,
    autocommit: bool,
}

impl<'a> ScriptRunner<'a> {
    pub fn new(
        connection: &'a dyn Connection,
        store: &'a dyn StateStore,
        substitutions: &'a SubstitutionContext,
        autocommit: bool,
    ) -> Self {
        Self {
            connection,
            store,
            substitutions,
            autocommit,
        }
    }

    /// Apply `plan`, downs then ups
    ///
    /// # Errors
    ///
    /// Returns `Execution` for the first failing script (with the scripts
    /// completed before it), or `Storage` when bookkeeping fails.
    pub fn apply(&self, plan: &Plan) -> Result<ExecutionReport, EvolutionError> {
        let mut report = ExecutionReport::default();

        let steps = plan
            .down_scripts
            .iter()
            .map(|script| (script, Direction::Down))
            .chain(plan.up_scripts.iter().map(|script| (script, Direction::Up)));

        for (script, direction) in steps {
            self.run_script(script, direction, &report)?;
            report.record(script.revision(), direction);
        }

        Ok(report)
    }

    fn run_script(
        &self,
        script: &Script,
        direction: Direction,
        completed: &ExecutionReport,
    ) -> Result<(), EvolutionError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::script_span(script.revision(), direction.as_str()).entered();

        let start = Instant::now();
        let outcome = if self.autocommit {
            self.run_autocommit(script, direction)
        } else {
            self.run_transactional(script, direction)
        };

        match outcome {
            Ok(()) => {
                #[cfg(feature = "metrics")]
                METRICS.record_script(direction, start.elapsed());
                log::info!(
                    "{} evolution {} in {}ms",
                    match direction {
                        Direction::Up => "Applied",
                        Direction::Down => "Reverted",
                    },
                    script.revision(),
                    start.elapsed().as_millis()
                );
                Ok(())
            }
            Err(ScriptFailure::Store(e)) => Err(e),
            Err(ScriptFailure::Script(cause)) => Err(self.fail(script, direction, cause, completed)),
        }
    }

    /// Record the failure, then build the error to surface
    fn fail(
        &self,
        script: &Script,
        direction: Direction,
        cause: String,
        completed: &ExecutionReport,
    ) -> EvolutionError {
        #[cfg(feature = "metrics")]
        METRICS.record_failure(direction);
        log::warn!(
            "Evolution {} ({direction}) failed: {cause}",
            script.revision()
        );

        if let Err(e) = self.store.record_inconsistent(script, direction, &cause) {
            return EvolutionError::Storage(format!(
                "evolution {} ({direction}) failed with '{cause}' and could not be marked inconsistent: {e}",
                script.revision()
            ));
        }

        EvolutionError::Execution {
            revision: script.revision(),
            direction,
            cause,
            completed: completed.clone(),
        }
    }

    fn run_transactional(&self, script: &Script, direction: Direction) -> Result<(), ScriptFailure> {
        let tx = Transaction::begin(self.connection)
            .map_err(|e| ScriptFailure::Store(EvolutionError::Storage(e.to_string())))?;

        match self.run_steps(script, direction) {
            Ok(()) => tx
                .commit()
                .map_err(|e| ScriptFailure::Script(e.to_string())),
            Err(failure) => {
                if let Err(e) = tx.rollback() {
                    log::warn!("Rollback of evolution {} failed: {e}", script.revision());
                }
                Err(failure)
            }
        }
    }

    fn run_autocommit(&self, script: &Script, direction: Direction) -> Result<(), ScriptFailure> {
        self.run_steps(script, direction)
    }

    /// Bookkeeping around the statements; the caller owns transaction control
    fn run_steps(&self, script: &Script, direction: Direction) -> Result<(), ScriptFailure> {
        self.store
            .record_applying(script, direction)
            .map_err(ScriptFailure::Store)?;

        self.execute_statements(script, direction)
            .map_err(ScriptFailure::Script)?;

        let recorded = match direction {
            Direction::Up => self.store.record_applied(script.revision()),
            Direction::Down => self.store.record_reverted(script.revision()),
        };
        recorded.map_err(ScriptFailure::Store)
    }

    fn execute_statements(&self, script: &Script, direction: Direction) -> Result<(), String> {
        let sql = self
            .substitutions
            .apply(script.sql(direction))
            .map_err(|e| e.to_string())?;

        for statement in split_statements(&sql) {
            log::debug!("Evolution {}: {statement}", script.revision());
            self.connection
                .execute(&statement)
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}
