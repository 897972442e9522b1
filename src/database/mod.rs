//! Database handles
//!
//! A [`Database`] is a named handle that opens sessions; a [`Connection`] is
//! one session: statement execution, transaction control, advisory locks and
//! the state store living in that session's database.

pub mod memory;
pub mod postgres;

use crate::evolution::state_store::{Namespace, StateStore};
use crate::executor::DbError;

pub use memory::MemoryDatabase;
pub use postgres::PostgresDatabase;

/// A named database that evolutions run against
pub trait Database: Send + Sync {
    /// Logical name; selects the script set
    fn name(&self) -> &str;

    /// Open a new session
    ///
    /// # Errors
    ///
    /// Returns `DbError` if the database is unreachable.
    fn connect(&self) -> Result<Box<dyn Connection + '_>, DbError>;
}

/// One database session
///
/// Dropping the connection closes the session and releases any advisory lock
/// it still holds.
pub trait Connection {
    /// Execute one statement, returning the number of rows affected
    fn execute(&self, sql: &str) -> Result<u64, DbError>;

    fn begin(&self) -> Result<(), DbError>;

    fn commit(&self) -> Result<(), DbError>;

    fn rollback(&self) -> Result<(), DbError>;

    /// Try once to take the session-level advisory lock named `key`
    fn try_advisory_lock(&self, key: &str) -> Result<bool, DbError>;

    fn advisory_unlock(&self, key: &str) -> Result<(), DbError>;

    /// State store for `namespace`, sharing this session (and its transaction)
    fn state_store<'a>(&'a self, namespace: &Namespace) -> Box<dyn StateStore + 'a>;
}
