//! Per-script transactions
//!
//! A `Transaction` wraps `BEGIN` / `COMMIT` / `ROLLBACK` on a [`Connection`].
//! Dropping an open transaction rolls it back, so an early return from a
//! failing script never leaves the session inside a transaction.

use crate::database::Connection;
use crate::executor::DbError;
use thiserror::Error;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Transaction error type
#[derive(Debug, Error)]
pub enum TransactionError {
    /// `BEGIN` failed
    #[error("Failed to begin transaction: {0}")]
    Begin(#[source] DbError),
    /// `COMMIT` failed
    #[error("Failed to commit transaction: {0}")]
    Commit(#[source] DbError),
    /// `ROLLBACK` failed
    #[error("Failed to roll back transaction: {0}")]
    Rollback(#[source] DbError),
}

/// An open transaction on a borrowed connection
pub struct Transaction<'a> {
    connection: &'a dyn Connection,
    closed: bool,
}

impl<'a> Transaction<'a> {
    /// Start a transaction
    pub fn begin(connection: &'a dyn Connection) -> Result<Self, TransactionError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::transaction_span("begin").entered();

        connection.begin().map_err(TransactionError::Begin)?;

        Ok(Self {
            connection,
            closed: false,
        })
    }

    /// Commit the transaction
    pub fn commit(mut self) -> Result<(), TransactionError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::transaction_span("commit").entered();

        self.closed = true;
        self.connection.commit().map_err(TransactionError::Commit)
    }

    /// Rollback the transaction
    pub fn rollback(mut self) -> Result<(), TransactionError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::transaction_span("rollback").entered();

        self.closed = true;
        self.connection.rollback().map_err(TransactionError::Rollback)
    }

    /// Check if the transaction is closed
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.connection.rollback() {
                log::warn!("Failed to roll back abandoned transaction: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryDatabase;
    use crate::database::Database;

    #[test]
    fn test_transaction_error_display() {
        let err = TransactionError::Commit(DbError::Other("connection reset".to_string()));
        assert!(err.to_string().contains("Failed to commit"));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_rollback_discards_statements() {
        let db = MemoryDatabase::new("default");
        let conn = db.connect().unwrap();

        let tx = Transaction::begin(conn.as_ref()).unwrap();
        conn.execute("CREATE TABLE widgets (id int)").unwrap();
        tx.rollback().unwrap();

        assert!(!db.has_table("widgets"));
    }

    #[test]
    fn test_drop_rolls_back_open_transaction() {
        let db = MemoryDatabase::new("default");
        let conn = db.connect().unwrap();

        {
            let _tx = Transaction::begin(conn.as_ref()).unwrap();
            conn.execute("CREATE TABLE widgets (id int)").unwrap();
        }

        assert!(!db.has_table("widgets"));
    }

    #[test]
    fn test_commit_keeps_statements() {
        let db = MemoryDatabase::new("default");
        let conn = db.connect().unwrap();

        let tx = Transaction::begin(conn.as_ref()).unwrap();
        conn.execute("CREATE TABLE widgets (id int)").unwrap();
        tx.commit().unwrap();

        assert!(db.has_table("widgets"));
    }
}
