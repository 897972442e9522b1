//! State store - applied-evolution bookkeeping inside the target database

use crate::evolution::error::EvolutionError;
use crate::evolution::{AppliedEvolution, Direction, Script};
use std::fmt;

/// Default name of the meta table
pub const DEFAULT_META_TABLE: &str = "play_evolutions";

/// The (schema, meta table) pair holding one bookkeeping table
///
/// An empty schema means the connection's default search path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub schema: String,
    pub meta_table: String,
}

impl Namespace {
    pub fn new(schema: impl Into<String>, meta_table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            meta_table: meta_table.into(),
        }
    }

    /// Quoted, optionally schema-qualified table name for SQL
    pub fn qualified_table(&self) -> String {
        if self.schema.is_empty() {
            quote_identifier(&self.meta_table)
        } else {
            format!(
                "{}.{}",
                quote_identifier(&self.schema),
                quote_identifier(&self.meta_table)
            )
        }
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new("", DEFAULT_META_TABLE)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.schema.is_empty() {
            f.write_str(&self.meta_table)
        } else {
            write!(f, "{}.{}", self.schema, self.meta_table)
        }
    }
}

/// Quote a PostgreSQL identifier
pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Persistent record of applied revisions
///
/// Every operation fails with `EvolutionError::Storage` when the underlying
/// connection is unusable; that is always fatal to the enclosing call.
pub trait StateStore {
    /// Create the meta table if it does not exist yet
    fn ensure_table(&self) -> Result<(), EvolutionError>;

    /// All recorded revisions, ascending
    fn load_applied(&self) -> Result<Vec<AppliedEvolution>, EvolutionError>;

    /// Mark `script` as running in `direction`, before its statements execute
    ///
    /// Up inserts (or replaces) the row; down flips an existing row.
    fn record_applying(&self, script: &Script, direction: Direction) -> Result<(), EvolutionError>;

    /// Mark a revision `applied` after its up statements succeeded
    fn record_applied(&self, revision: u32) -> Result<(), EvolutionError>;

    /// Delete a revision after its down statements succeeded
    fn record_reverted(&self, revision: u32) -> Result<(), EvolutionError>;

    /// Mark `script` inconsistent with the captured error
    ///
    /// Upserts, since a rolled back transaction may have erased the `applying_*` row.
    fn record_inconsistent(
        &self,
        script: &Script,
        direction: Direction,
        error: &str,
    ) -> Result<(), EvolutionError>;
}
