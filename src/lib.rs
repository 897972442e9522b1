//! # Evolutions
//!
//! Versioned schema evolutions for PostgreSQL. Numbered up/down scripts are
//! reconciled with the bookkeeping table inside the target database and
//! applied under an advisory lock, one transaction per script unless
//! autocommit is configured.
//!
//! See [`evolution`] for the script format and the reconciliation rules, and
//! [`evolution::apply_evolutions`] for the usual entry point.

pub mod config;
pub mod connection;
pub mod database;
pub mod evolution;
pub mod executor;
pub mod metrics;
pub mod transaction;

pub use config::{DatabaseConfig, EvolutionsConfig};
pub use connection::{connect, validate_connection_string, ConnectionError};
pub use database::{Connection, Database, MemoryDatabase, PostgresDatabase};
pub use evolution::{
    apply_evolutions, cleanup_evolutions, evolution_status, resolve_evolution, DatabaseEvolutions,
    DirectoryEvolutionsReader, EvolutionError, EvolutionsReader, ExecutionReport, Script,
    SimpleEvolutionsReader,
};
pub use executor::{DbError, MayPostgresExecutor, SqlExecutor};
pub use transaction::{Transaction, TransactionError};
