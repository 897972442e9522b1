//! PostgreSQL meta table management

use crate::evolution::error::EvolutionError;
use crate::evolution::state_store::{Namespace, StateStore};
use crate::evolution::{AppliedEvolution, Direction, EvolutionState, Script};
use crate::executor::{DbError, SqlExecutor};
use may_postgres::Row;

/// `CREATE TABLE IF NOT EXISTS` statement for the meta table
///
/// Columns:
/// - `id` - revision
/// - `hash` - checksum of the applied script
/// - `applied_at` - last state change, UTC
/// - `apply_script` / `revert_script` - raw SQL as applied
/// - `state` - `applying_up`, `applied`, `applying_down`, `inconsistent_up`, `inconsistent_down`
/// - `last_problem` - error text of the last failed attempt
pub fn create_state_table_sql(namespace: &Namespace) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            id INTEGER NOT NULL PRIMARY KEY,
            hash VARCHAR(255) NOT NULL,
            applied_at TIMESTAMP NOT NULL,
            apply_script TEXT,
            revert_script TEXT,
            state VARCHAR(255),
            last_problem TEXT
        )
        "#,
        namespace.qualified_table()
    )
}

/// `StateStore` over a PostgreSQL session
pub struct PostgresStateStore<'a> {
    executor: &'a dyn SqlExecutor,
    namespace: Namespace,
}

impl<'a> PostgresStateStore<'a> {
    pub fn new(executor: &'a dyn SqlExecutor, namespace: Namespace) -> Self {
        Self { executor, namespace }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn table(&self) -> String {
        self.namespace.qualified_table()
    }

    fn upsert(
        &self,
        script: &Script,
        state: EvolutionState,
        last_problem: Option<&str>,
    ) -> Result<(), EvolutionError> {
        let sql = upsert_sql(&self.table());
        let id = to_id(script.revision())?;
        let hash = script.checksum();
        self.executor.execute(
            &sql,
            &[
                &id,
                &hash,
                &script.up_sql(),
                &script.down_sql(),
                &state.as_str(),
                &last_problem,
            ],
        )?;
        Ok(())
    }

    fn update_state(&self, revision: u32, state: EvolutionState) -> Result<(), EvolutionError> {
        let sql = update_state_sql(&self.table());
        let id = to_id(revision)?;
        let updated = self.executor.execute(&sql, &[&state.as_str(), &id])?;
        if updated == 0 {
            return Err(EvolutionError::Storage(format!(
                "no row for revision {revision} in {}",
                self.namespace
            )));
        }
        Ok(())
    }
}

/// `applied_at` has no time zone; it always holds UTC
const NOW_UTC: &str = "NOW() AT TIME ZONE 'UTC'";

fn upsert_sql(table: &str) -> String {
    format!(
        r#"
        INSERT INTO {table} (id, hash, applied_at, apply_script, revert_script, state, last_problem)
        VALUES ($1, $2, {NOW_UTC}, $3, $4, $5, $6)
        ON CONFLICT (id) DO UPDATE SET
            hash = EXCLUDED.hash,
            applied_at = EXCLUDED.applied_at,
            apply_script = EXCLUDED.apply_script,
            revert_script = EXCLUDED.revert_script,
            state = EXCLUDED.state,
            last_problem = EXCLUDED.last_problem
        "#
    )
}

fn update_state_sql(table: &str) -> String {
    format!(
        "UPDATE {table} SET state = $1, last_problem = NULL, applied_at = {NOW_UTC} WHERE id = $2"
    )
}

fn to_id(revision: u32) -> Result<i32, EvolutionError> {
    i32::try_from(revision).map_err(|_| {
        EvolutionError::Storage(format!("revision {revision} does not fit the INTEGER id column"))
    })
}

fn row_to_evolution(row: &Row) -> Result<AppliedEvolution, DbError> {
    let id: i32 = row.try_get(0)?;
    let revision = u32::try_from(id)
        .map_err(|_| DbError::ParseError(format!("negative revision id {id}")))?;
    let hash: String = row.try_get(1)?;
    let applied_at: String = row.try_get(2)?;
    let apply_script: Option<String> = row.try_get(3)?;
    let revert_script: Option<String> = row.try_get(4)?;
    let state: Option<String> = row.try_get(5)?;
    let last_problem: Option<String> = row.try_get(6)?;

    Ok(AppliedEvolution {
        revision,
        hash,
        state: state.as_deref().unwrap_or("applied").parse()?,
        applied_at: AppliedEvolution::parse_timestamp(&applied_at)?,
        apply_script: apply_script.unwrap_or_default(),
        revert_script: revert_script.unwrap_or_default(),
        last_problem,
    })
}

impl StateStore for PostgresStateStore<'_> {
    fn ensure_table(&self) -> Result<(), EvolutionError> {
        self.executor
            .execute(&create_state_table_sql(&self.namespace), &[])?;
        Ok(())
    }

    fn load_applied(&self) -> Result<Vec<AppliedEvolution>, EvolutionError> {
        // `may_postgres` hands TIMESTAMP back most reliably as text
        let sql = format!(
            r#"
            SELECT id, hash, applied_at::text, apply_script, revert_script, state, last_problem
            FROM {}
            ORDER BY id ASC
            "#,
            self.table()
        );

        let rows = self.executor.query_all(&sql, &[])?;
        rows.iter()
            .map(|row| row_to_evolution(row).map_err(EvolutionError::from))
            .collect()
    }

    fn record_applying(&self, script: &Script, direction: Direction) -> Result<(), EvolutionError> {
        match direction {
            Direction::Up => self.upsert(script, EvolutionState::ApplyingUp, None),
            Direction::Down => {
                self.update_state(script.revision(), EvolutionState::ApplyingDown)
            }
        }
    }

    fn record_applied(&self, revision: u32) -> Result<(), EvolutionError> {
        self.update_state(revision, EvolutionState::Applied)
    }

    fn record_reverted(&self, revision: u32) -> Result<(), EvolutionError> {
        let sql = format!("DELETE FROM {} WHERE id = $1", self.table());
        let id = to_id(revision)?;
        self.executor.execute(&sql, &[&id])?;
        Ok(())
    }

    fn record_inconsistent(
        &self,
        script: &Script,
        direction: Direction,
        error: &str,
    ) -> Result<(), EvolutionError> {
        self.upsert(script, EvolutionState::Inconsistent(direction), Some(error))
    }
}
