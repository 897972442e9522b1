//! `DatabaseEvolutions` - evolutions service for one database
//!
//! Every operation opens its own connection, takes the evolutions lock,
//! makes sure the meta table exists and only then reads the recorded state,
//! so the plan always reflects what earlier callers committed.

use crate::config::EvolutionsConfig;
use crate::database::{Connection, Database};
use crate::evolution::error::EvolutionError;
use crate::evolution::lock::{LockKey, LockManager};
use crate::evolution::plan::{check_recorded_hashes, reconcile, reset_plan, Plan};
use crate::evolution::reader::EvolutionsReader;
use crate::evolution::runner::{ExecutionReport, ScriptRunner};
use crate::evolution::state_store::{Namespace, StateStore};
use crate::evolution::status::EvolutionStatus;
use crate::evolution::{AppliedEvolution, Direction, EvolutionState, Script};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Evolutions for one database and one configuration
pub struct DatabaseEvolutions<'a, D: Database + ?Sized> {
    database: &'a D,
    config: &'a EvolutionsConfig,
    locks: &'a LockManager,
}

impl<'a, D: Database + ?Sized> DatabaseEvolutions<'a, D> {
    /// Service using the process-wide lock manager
    pub fn new(database: &'a D, config: &'a EvolutionsConfig) -> Self {
        Self {
            database,
            config,
            locks: LockManager::global(),
        }
    }

    #[must_use]
    pub fn with_lock_manager(mut self, locks: &'a LockManager) -> Self {
        self.locks = locks;
        self
    }

    pub fn namespace(&self) -> Namespace {
        self.config.namespace()
    }

    pub fn lock_key(&self) -> LockKey {
        LockKey::new(
            self.database.name(),
            &self.config.schema,
            &self.config.meta_table,
        )
    }

    /// Desired scripts for this database
    pub fn scripts(&self, reader: &dyn EvolutionsReader) -> Result<Vec<Script>, EvolutionError> {
        Ok(reader.read(self.database.name())?)
    }

    /// The plan an evolve call would run right now
    pub fn plan(&self, reader: &dyn EvolutionsReader) -> Result<Plan, EvolutionError> {
        let scripts = self.scripts(reader)?;
        self.locked("plan", |_, store| reconcile(&scripts, &self.load_applied(store)?))
    }

    /// Bring the database in line with `reader`'s scripts
    ///
    /// # Errors
    ///
    /// - `Read` if the scripts are malformed (nothing runs)
    /// - `InconsistentState` if an earlier run left a revision unresolved
    /// - `Execution` if a script fails; it is recorded as inconsistent
    /// - `LockTimeout` if another caller holds the lock for too long
    pub fn evolve(&self, reader: &dyn EvolutionsReader) -> Result<ExecutionReport, EvolutionError> {
        let scripts = self.scripts(reader)?;

        self.locked("evolve", |connection, store| {
            let plan = reconcile(&scripts, &self.load_applied(store)?)?;
            self.execute(connection, store, &plan)
        })
    }

    /// Revert every recorded revision, newest first
    pub fn reset(&self) -> Result<ExecutionReport, EvolutionError> {
        self.locked("reset", |connection, store| {
            let plan = reset_plan(&store.load_applied()?)?;
            self.execute(connection, store, &plan)
        })
    }

    /// Recorded rows and pending plan, without running anything
    pub fn status(&self, reader: &dyn EvolutionsReader) -> Result<EvolutionStatus, EvolutionError> {
        let scripts = self.scripts(reader)?;

        self.locked("status", |_, store| {
            let applied = self.load_applied(store)?;
            match reconcile(&scripts, &applied) {
                Ok(plan) => Ok(EvolutionStatus::new(applied, Some(plan), Vec::new())),
                Err(EvolutionError::InconsistentState { blocked }) => {
                    Ok(EvolutionStatus::new(applied, None, blocked))
                }
                Err(e) => Err(e),
            }
        })
    }

    /// Mark a blocked revision as settled after fixing the database by hand
    ///
    /// A failed or unfinished up run becomes `applied`; a failed or unfinished
    /// down run removes the row.
    pub fn resolve(&self, revision: u32) -> Result<(), EvolutionError> {
        self.locked("resolve", |_, store| {
            let applied = store.load_applied()?;
            let row = applied
                .iter()
                .find(|row| row.revision == revision)
                .ok_or_else(|| EvolutionError::Resolve {
                    revision,
                    reason: format!("no such revision recorded in {}", self.namespace()),
                })?;

            match row.state.unfinished_direction() {
                Some(Direction::Up) => store.record_applied(revision)?,
                Some(Direction::Down) => store.record_reverted(revision)?,
                None => {
                    return Err(EvolutionError::Resolve {
                        revision,
                        reason: format!("revision is already {}", EvolutionState::Applied),
                    })
                }
            }

            log::info!(
                "Resolved evolution {revision} ({}) on database '{}'",
                row.state,
                self.database.name()
            );
            Ok(())
        })
    }

    /// Recorded rows, provided their hashes can be compared with ours
    fn load_applied(
        &self,
        store: &dyn StateStore,
    ) -> Result<Vec<AppliedEvolution>, EvolutionError> {
        let applied = store.load_applied()?;
        check_recorded_hashes(&applied, &self.namespace())?;
        Ok(applied)
    }

    fn execute(
        &self,
        connection: &dyn Connection,
        store: &dyn StateStore,
        plan: &Plan,
    ) -> Result<ExecutionReport, EvolutionError> {
        if plan.is_empty() {
            log::debug!("Database '{}' is up to date", self.database.name());
            return Ok(ExecutionReport::default());
        }

        log::debug!(
            "Evolutions plan for '{}': revert {:?}, apply {:?}",
            self.database.name(),
            plan.down_revisions(),
            plan.up_revisions()
        );

        ScriptRunner::new(
            connection,
            store,
            &self.config.substitutions,
            self.config.autocommit,
        )
        .apply(plan)
    }

    /// Run `body` on a fresh connection, under the lock, with the meta table in place
    fn locked<T>(
        &self,
        operation: &str,
        body: impl FnOnce(&dyn Connection, &dyn StateStore) -> Result<T, EvolutionError>,
    ) -> Result<T, EvolutionError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::evolve_span(self.database.name(), &self.config.meta_table, operation)
            .entered();
        #[cfg(not(feature = "tracing"))]
        let _ = operation;

        self.config.validate()?;

        let connection = self.database.connect()?;
        let store = connection.state_store(&self.namespace());
        let _guard = self.locks.acquire(
            connection.as_ref(),
            self.lock_key(),
            self.config.lock_timeout(),
        )?;

        store.ensure_table()?;
        body(connection.as_ref(), store.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryDatabase;
    use crate::evolution::SimpleEvolutionsReader;

    fn script(revision: u32) -> Script {
        Script::new(
            revision,
            format!("CREATE TABLE t{revision} (id int);"),
            format!("DROP TABLE t{revision};"),
        )
    }

    #[test]
    fn test_status_reports_pending_without_running() {
        let db = MemoryDatabase::new("default");
        let config = EvolutionsConfig::default();
        let reader = SimpleEvolutionsReader::for_default([script(1), script(2)]);

        let status = DatabaseEvolutions::new(&db, &config).status(&reader).unwrap();
        assert_eq!(status.pending_count(), 2);
        assert!(db.tables().is_empty());

        // the meta table exists after the first call
        let conn = db.connect().unwrap();
        assert!(conn.state_store(&Namespace::default()).load_applied().unwrap().is_empty());
    }

    #[test]
    fn test_resolve_up_marks_applied() {
        let db = MemoryDatabase::new("default");
        let config = EvolutionsConfig::default();
        db.insert_evolution(
            "",
            "play_evolutions",
            crate::evolution::AppliedEvolution::from_script(
                &script(1),
                EvolutionState::Inconsistent(Direction::Up),
                Some("boom".to_string()),
            ),
        );

        let evolutions = DatabaseEvolutions::new(&db, &config);
        evolutions.resolve(1).unwrap();

        let rows = db.applied_evolutions("", "play_evolutions");
        assert_eq!(rows[0].state, EvolutionState::Applied);
        assert_eq!(rows[0].last_problem, None);
    }

    #[test]
    fn test_resolve_down_removes_row() {
        let db = MemoryDatabase::new("default");
        let config = EvolutionsConfig::default();
        db.insert_evolution(
            "",
            "play_evolutions",
            crate::evolution::AppliedEvolution::from_script(&script(1), EvolutionState::ApplyingDown, None),
        );

        DatabaseEvolutions::new(&db, &config).resolve(1).unwrap();
        assert!(db.applied_evolutions("", "play_evolutions").is_empty());
    }

    #[test]
    fn test_resolve_rejects_settled_or_missing_revisions() {
        let db = MemoryDatabase::new("default");
        let config = EvolutionsConfig::default();
        let evolutions = DatabaseEvolutions::new(&db, &config);
        evolutions
            .evolve(&SimpleEvolutionsReader::for_default([script(1)]))
            .unwrap();

        assert!(matches!(
            evolutions.resolve(1),
            Err(EvolutionError::Resolve { revision: 1, .. })
        ));
        assert!(matches!(
            evolutions.resolve(9),
            Err(EvolutionError::Resolve { revision: 9, .. })
        ));
    }

    #[test]
    fn test_read_errors_surface_before_connecting() {
        let db = MemoryDatabase::new("default");
        db.set_offline(true);
        let config = EvolutionsConfig::default();
        let reader = SimpleEvolutionsReader::for_default([script(1), script(1)]);

        let err = DatabaseEvolutions::new(&db, &config).evolve(&reader).unwrap_err();
        assert!(matches!(err, EvolutionError::Read(_)));
    }

    #[test]
    fn test_offline_database_is_a_storage_error() {
        let db = MemoryDatabase::new("default");
        db.set_offline(true);
        let config = EvolutionsConfig::default();

        let err = DatabaseEvolutions::new(&db, &config).reset().unwrap_err();
        assert!(matches!(err, EvolutionError::Storage(_)));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let db = MemoryDatabase::new("default");
        let config = EvolutionsConfig::default().with_meta_table("");

        let err = DatabaseEvolutions::new(&db, &config).reset().unwrap_err();
        assert!(matches!(err, EvolutionError::Config(_)));
    }

    #[test]
    fn test_schema_scopes_meta_table() {
        let db = MemoryDatabase::new("default");
        let config = EvolutionsConfig::default().with_schema("audit");

        DatabaseEvolutions::new(&db, &config)
            .evolve(&SimpleEvolutionsReader::for_default([script(1)]))
            .unwrap();

        assert_eq!(db.applied_evolutions("audit", "play_evolutions").len(), 1);
        assert!(db.applied_evolutions("", "play_evolutions").is_empty());
    }
}
