//! In-memory database
//!
//! Tracks the tables created and dropped by evolution scripts, keeps meta
//! tables as plain maps and supports transactions through a per-connection
//! undo log. Statements other than `CREATE TABLE` / `DROP TABLE` are accepted
//! and only logged. Used by tests and for dry runs of a script set.

use crate::database::{Connection, Database};
use crate::evolution::state_store::{Namespace, StateStore};
use crate::evolution::{AppliedEvolution, Direction, EvolutionError, EvolutionState, Script};
use crate::executor::DbError;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

type MetaTable = BTreeMap<u32, AppliedEvolution>;

/// A statement executed against a [`MemoryDatabase`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedStatement {
    /// Global execution order
    pub seq: u64,
    /// Connection that ran the statement
    pub connection: u64,
    pub sql: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeSet<String>,
    meta_tables: HashMap<Namespace, MetaTable>,
    statements: Vec<LoggedStatement>,
    failures: Vec<String>,
    offline: bool,
    advisory_locks: HashMap<String, u64>,
    next_connection: u64,
    next_seq: u64,
}

impl MemoryState {
    fn check_online(&self) -> Result<(), DbError> {
        if self.offline {
            Err(DbError::Other("database is offline".to_string()))
        } else {
            Ok(())
        }
    }
}

enum Undo {
    CreateTable(String),
    DropTable(String),
    Row {
        namespace: Namespace,
        revision: u32,
        previous: Option<AppliedEvolution>,
    },
}

/// Shared in-memory database; clones see the same state
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    name: String,
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryDatabase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Make every statement containing `fragment` fail
    pub fn fail_statements_containing(&self, fragment: impl Into<String>) {
        self.inner.lock().failures.push(fragment.into());
    }

    pub fn clear_failures(&self) {
        self.inner.lock().failures.clear();
    }

    /// Simulate losing the server: connects, statements and bookkeeping fail
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.inner.lock().tables.contains(&normalize_name(name))
    }

    pub fn tables(&self) -> Vec<String> {
        self.inner.lock().tables.iter().cloned().collect()
    }

    /// Every statement executed so far, in execution order
    pub fn statement_log(&self) -> Vec<LoggedStatement> {
        self.inner.lock().statements.clone()
    }

    pub fn is_advisory_locked(&self, key: &str) -> bool {
        self.inner.lock().advisory_locks.contains_key(key)
    }

    /// Rows of a meta table, ascending; empty if the table does not exist
    pub fn applied_evolutions(&self, schema: &str, meta_table: &str) -> Vec<AppliedEvolution> {
        self.inner
            .lock()
            .meta_tables
            .get(&Namespace::new(schema, meta_table))
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Write a meta table row directly, creating the table if needed
    pub fn insert_evolution(&self, schema: &str, meta_table: &str, row: AppliedEvolution) {
        self.inner
            .lock()
            .meta_tables
            .entry(Namespace::new(schema, meta_table))
            .or_default()
            .insert(row.revision, row);
    }
}

impl Database for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&self) -> Result<Box<dyn Connection + '_>, DbError> {
        let mut state = self.inner.lock();
        state.check_online()?;
        state.next_connection += 1;
        let id = state.next_connection;
        drop(state);

        Ok(Box::new(MemoryConnection {
            id,
            inner: Arc::clone(&self.inner),
            transaction: Mutex::new(None),
        }))
    }
}

/// One session on a [`MemoryDatabase`]
pub struct MemoryConnection {
    id: u64,
    inner: Arc<Mutex<MemoryState>>,
    /// Undo entries of the open transaction, if any
    transaction: Mutex<Option<Vec<Undo>>>,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn record_undo(&self, undo: Undo) {
        if let Some(entries) = self.transaction.lock().as_mut() {
            entries.push(undo);
        }
    }

    fn undo_all(&self, entries: Vec<Undo>) {
        let mut state = self.inner.lock();
        for undo in entries.into_iter().rev() {
            match undo {
                Undo::CreateTable(name) => {
                    state.tables.remove(&name);
                }
                Undo::DropTable(name) => {
                    state.tables.insert(name);
                }
                Undo::Row {
                    namespace,
                    revision,
                    previous,
                } => {
                    let rows = state.meta_tables.entry(namespace).or_default();
                    match previous {
                        Some(row) => {
                            rows.insert(revision, row);
                        }
                        None => {
                            rows.remove(&revision);
                        }
                    }
                }
            }
        }
    }

    /// Apply a schema change, returning the undo entry for it
    fn interpret(state: &mut MemoryState, sql: &str) -> Result<Option<Undo>, DbError> {
        let lowered = sql.to_lowercase();
        let tokens: Vec<&str> = lowered.split_whitespace().collect();

        match tokens.as_slice() {
            ["create", "table", "if", "not", "exists", name, ..] => {
                let name = normalize_name(name);
                if state.tables.insert(name.clone()) {
                    Ok(Some(Undo::CreateTable(name)))
                } else {
                    Ok(None)
                }
            }
            ["create", "table", name, ..] => {
                let name = normalize_name(name);
                if !state.tables.insert(name.clone()) {
                    return Err(DbError::QueryError(format!(
                        "relation \"{name}\" already exists"
                    )));
                }
                Ok(Some(Undo::CreateTable(name)))
            }
            ["drop", "table", "if", "exists", name, ..] => {
                let name = normalize_name(name);
                if state.tables.remove(&name) {
                    Ok(Some(Undo::DropTable(name)))
                } else {
                    Ok(None)
                }
            }
            ["drop", "table", name, ..] => {
                let name = normalize_name(name);
                if !state.tables.remove(&name) {
                    return Err(DbError::QueryError(format!(
                        "table \"{name}\" does not exist"
                    )));
                }
                Ok(Some(Undo::DropTable(name)))
            }
            _ => Ok(None),
        }
    }
}

/// Lowercase, unquoted table name without a trailing column list
fn normalize_name(raw: &str) -> String {
    raw.split('(')
        .next()
        .unwrap_or_default()
        .trim_end_matches(';')
        .replace('"', "")
        .to_lowercase()
}

impl Connection for MemoryConnection {
    fn execute(&self, sql: &str) -> Result<u64, DbError> {
        let undo = {
            let mut state = self.inner.lock();
            state.check_online()?;

            if let Some(fragment) = state.failures.iter().find(|f| sql.contains(f.as_str())) {
                return Err(DbError::QueryError(format!(
                    "statement rejected ({fragment}): {sql}"
                )));
            }

            let undo = Self::interpret(&mut state, sql)?;
            state.next_seq += 1;
            let seq = state.next_seq;
            state.statements.push(LoggedStatement {
                seq,
                connection: self.id,
                sql: sql.to_string(),
            });
            undo
        };

        if let Some(undo) = undo {
            self.record_undo(undo);
        }
        Ok(0)
    }

    fn begin(&self) -> Result<(), DbError> {
        self.inner.lock().check_online()?;
        let mut transaction = self.transaction.lock();
        if transaction.is_some() {
            return Err(DbError::QueryError(
                "there is already a transaction in progress".to_string(),
            ));
        }
        *transaction = Some(Vec::new());
        Ok(())
    }

    fn commit(&self) -> Result<(), DbError> {
        self.inner.lock().check_online()?;
        self.transaction.lock().take();
        Ok(())
    }

    fn rollback(&self) -> Result<(), DbError> {
        let entries = self.transaction.lock().take();
        if let Some(entries) = entries {
            self.undo_all(entries);
        }
        Ok(())
    }

    fn try_advisory_lock(&self, key: &str) -> Result<bool, DbError> {
        let mut state = self.inner.lock();
        state.check_online()?;
        match state.advisory_locks.get(key) {
            Some(owner) => Ok(*owner == self.id),
            None => {
                state.advisory_locks.insert(key.to_string(), self.id);
                Ok(true)
            }
        }
    }

    fn advisory_unlock(&self, key: &str) -> Result<(), DbError> {
        let mut state = self.inner.lock();
        if state.advisory_locks.get(key) == Some(&self.id) {
            state.advisory_locks.remove(key);
        }
        Ok(())
    }

    fn state_store<'a>(&'a self, namespace: &Namespace) -> Box<dyn StateStore + 'a> {
        Box::new(MemoryStateStore {
            connection: self,
            namespace: namespace.clone(),
        })
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        // closing the session aborts its transaction and frees its locks
        let entries = self.transaction.lock().take();
        if let Some(entries) = entries {
            self.undo_all(entries);
        }
        let id = self.id;
        self.inner.lock().advisory_locks.retain(|_, owner| *owner != id);
    }
}

/// Meta table kept in [`MemoryDatabase`], transactional with its connection
struct MemoryStateStore<'a> {
    connection: &'a MemoryConnection,
    namespace: Namespace,
}

impl MemoryStateStore<'_> {
    /// Run `change` on the meta table, recording the prior row for rollback
    fn mutate(
        &self,
        revision: u32,
        change: impl FnOnce(Option<&AppliedEvolution>) -> Result<Option<AppliedEvolution>, EvolutionError>,
    ) -> Result<(), EvolutionError> {
        let previous = {
            let mut state = self.connection.inner.lock();
            state.check_online()?;
            let rows = state.meta_tables.get_mut(&self.namespace).ok_or_else(|| {
                EvolutionError::Storage(format!(
                    "relation \"{}\" does not exist",
                    self.namespace
                ))
            })?;

            let previous = rows.get(&revision).cloned();
            match change(previous.as_ref())? {
                Some(row) => {
                    rows.insert(revision, row);
                }
                None => {
                    rows.remove(&revision);
                }
            }
            previous
        };

        self.connection.record_undo(Undo::Row {
            namespace: self.namespace.clone(),
            revision,
            previous,
        });
        Ok(())
    }

    fn set_state(&self, revision: u32, state: EvolutionState) -> Result<(), EvolutionError> {
        let namespace = &self.namespace;
        self.mutate(revision, |current| match current {
            Some(row) => Ok(Some(AppliedEvolution {
                state,
                applied_at: chrono::Utc::now(),
                last_problem: None,
                ..row.clone()
            })),
            None => Err(EvolutionError::Storage(format!(
                "no row for revision {revision} in {namespace}"
            ))),
        })
    }
}

impl StateStore for MemoryStateStore<'_> {
    fn ensure_table(&self) -> Result<(), EvolutionError> {
        let mut state = self.connection.inner.lock();
        state.check_online()?;
        state.meta_tables.entry(self.namespace.clone()).or_default();
        Ok(())
    }

    fn load_applied(&self) -> Result<Vec<AppliedEvolution>, EvolutionError> {
        let state = self.connection.inner.lock();
        state.check_online()?;
        state
            .meta_tables
            .get(&self.namespace)
            .map(|rows| rows.values().cloned().collect())
            .ok_or_else(|| {
                EvolutionError::Storage(format!(
                    "relation \"{}\" does not exist",
                    self.namespace
                ))
            })
    }

    fn record_applying(&self, script: &Script, direction: Direction) -> Result<(), EvolutionError> {
        match direction {
            Direction::Up => self.mutate(script.revision(), |_| {
                Ok(Some(AppliedEvolution::from_script(
                    script,
                    EvolutionState::ApplyingUp,
                    None,
                )))
            }),
            Direction::Down => self.set_state(script.revision(), EvolutionState::ApplyingDown),
        }
    }

    fn record_applied(&self, revision: u32) -> Result<(), EvolutionError> {
        self.set_state(revision, EvolutionState::Applied)
    }

    fn record_reverted(&self, revision: u32) -> Result<(), EvolutionError> {
        self.mutate(revision, |_| Ok(None))
    }

    fn record_inconsistent(
        &self,
        script: &Script,
        direction: Direction,
        error: &str,
    ) -> Result<(), EvolutionError> {
        self.mutate(script.revision(), |_| {
            Ok(Some(AppliedEvolution::from_script(
                script,
                EvolutionState::Inconsistent(direction),
                Some(error.to_string()),
            )))
        })
    }
}
