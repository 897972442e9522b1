//! Evolution error types

use crate::evolution::lock::LockKey;
use crate::evolution::record::EvolutionState;
use crate::evolution::runner::ExecutionReport;
use crate::evolution::Direction;
use crate::executor::DbError;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Malformed script source; always reported before anything executes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadError {
    /// The script source could not be read
    #[error("Failed to read evolutions from {path}: {reason}")]
    Io { path: String, reason: String },
    /// Two scripts claim the same revision
    #[error("Duplicate evolution revision {revision} for database '{database}'")]
    DuplicateRevision { database: String, revision: u32 },
    /// A script lacks its `!Ups` or `!Downs` marker
    #[error("Evolution script {script} is missing the `!{marker}` section marker")]
    MissingMarker { script: String, marker: &'static str },
    /// A script declares the same section twice
    #[error("Evolution script {script} declares the `!{marker}` section more than once")]
    DuplicateMarker { script: String, marker: &'static str },
    /// A script body or file name cannot be parsed
    #[error("Invalid evolution script {script}: {reason}")]
    InvalidFormat { script: String, reason: String },
}

/// A revision that keeps its namespace from being evolved automatically
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedRevision {
    pub revision: u32,
    pub state: EvolutionState,
    pub problem: Option<String>,
}

/// Errors surfaced by the evolutions engine
#[derive(Debug, Error)]
pub enum EvolutionError {
    /// Malformed or duplicate script source
    #[error("Failed to read evolutions: {0}")]
    Read(#[from] ReadError),

    /// A previous run left revisions unresolved; requires operator intervention
    #[error(
        "Database is in an inconsistent state: {}. Fix the database by hand, then resolve the revision(s)",
        describe_blocked(.blocked)
    )]
    InconsistentState { blocked: Vec<BlockedRevision> },

    /// Meta table unreachable or corrupt
    #[error("Evolutions storage error: {0}")]
    Storage(String),

    /// A script's statements failed; the state store records the failure
    #[error("Evolution {revision} ({direction}) failed: {cause}")]
    Execution {
        revision: u32,
        direction: Direction,
        cause: String,
        /// Scripts that completed before the failure
        completed: ExecutionReport,
    },

    /// The advisory lock was not obtained in time
    #[error(
        "Timed out after {}ms waiting for the evolutions lock on {key}; another process may be applying evolutions",
        .waited.as_millis()
    )]
    LockTimeout { key: LockKey, waited: Duration },

    /// Manual resolution was requested for a revision that cannot be resolved
    #[error("Cannot resolve evolution {revision}: {reason}")]
    Resolve { revision: u32, reason: String },

    /// Invalid configuration
    #[error("Invalid evolutions configuration: {0}")]
    Config(String),
}

impl EvolutionError {
    /// Whether retrying the same call later can succeed without operator action
    pub fn is_retryable(&self) -> bool {
        matches!(self, EvolutionError::LockTimeout { .. })
    }

    /// The revision the failure is about, when there is exactly one
    pub fn revision(&self) -> Option<u32> {
        match self {
            EvolutionError::Execution { revision, .. } | EvolutionError::Resolve { revision, .. } => {
                Some(*revision)
            }
            EvolutionError::InconsistentState { blocked } if blocked.len() == 1 => {
                Some(blocked[0].revision)
            }
            _ => None,
        }
    }

    /// Revisions blocking the namespace (empty for every other error)
    pub fn blocked_revisions(&self) -> Vec<u32> {
        match self {
            EvolutionError::InconsistentState { blocked } => {
                blocked.iter().map(|b| b.revision).collect()
            }
            _ => Vec::new(),
        }
    }
}

impl From<DbError> for EvolutionError {
    fn from(error: DbError) -> Self {
        EvolutionError::Storage(error.to_string())
    }
}

fn describe_blocked(blocked: &[BlockedRevision]) -> String {
    blocked
        .iter()
        .map(|b| match &b.problem {
            Some(problem) => format!("revision {} is {} ({})", b.revision, b.state, problem),
            None => format!("revision {} is {}", b.revision, b.state),
        })
        .collect::<Vec<_>>()
        .join("; ")
}
