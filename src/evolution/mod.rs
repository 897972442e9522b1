//! Evolutions - versioned schema reconciliation
//!
//! Numbered scripts carry an up section and a down section. Each run compares
//! the desired scripts with the rows of the meta table inside the target
//! database, reverts what changed or disappeared (newest first, with the down
//! script recorded at apply time), then applies what is missing (oldest
//! first). Runs on the same (database, schema, meta table) serialize on an
//! advisory lock.
//!
//! # Script files
//!
//! ```sql
//! -- !Ups
//! CREATE TABLE users (id bigint NOT NULL PRIMARY KEY, email varchar(255));
//!
//! -- !Downs
//! DROP TABLE users;
//! ```
//!
//! stored as `<root>/<database>/<revision>.sql` for [`DirectoryEvolutionsReader`].
//!
//! # Example
//!
//! ```rust
//! use evolutions::config::EvolutionsConfig;
//! use evolutions::database::MemoryDatabase;
//! use evolutions::evolution::{apply_evolutions, Script, SimpleEvolutionsReader};
//!
//! let database = MemoryDatabase::new("default");
//! let reader = SimpleEvolutionsReader::for_default([
//!     Script::new(1, "CREATE TABLE users (id bigint);", "DROP TABLE users;"),
//! ]);
//!
//! let report = apply_evolutions(&database, &reader, &EvolutionsConfig::default()).unwrap();
//! assert_eq!(report.applied, vec![1]);
//! assert!(database.has_table("users"));
//! ```

pub mod checksum;
pub mod error;
pub mod evolver;
pub mod file;
pub mod lock;
pub mod plan;
pub mod reader;
pub mod record;
pub mod runner;
pub mod script;
pub mod startup;
pub mod state_store;
pub mod state_table;
pub mod statements;
pub mod status;
pub mod substitution;

pub use checksum::script_checksum;
pub use error::{BlockedRevision, EvolutionError, ReadError};
pub use evolver::DatabaseEvolutions;
pub use lock::{EvolutionLockGuard, LockKey, LockManager, DEFAULT_LOCK_TIMEOUT};
pub use plan::{reconcile, reset_plan, Plan};
pub use reader::{DirectoryEvolutionsReader, EvolutionsReader, SimpleEvolutionsReader, DEFAULT_DATABASE};
pub use record::{AppliedEvolution, EvolutionState};
pub use runner::{ExecutionReport, ScriptRunner};
pub use script::{Direction, Script};
pub use startup::{apply_evolutions, cleanup_evolutions, evolution_status, resolve_evolution};
pub use state_store::{Namespace, StateStore, DEFAULT_META_TABLE};
pub use state_table::PostgresStateStore;
pub use status::EvolutionStatus;
pub use substitution::SubstitutionContext;
