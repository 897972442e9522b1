//! `AppliedEvolution` - rows of the evolutions meta table

use crate::evolution::{Direction, Script};
use crate::executor::DbError;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a recorded revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub enum EvolutionState {
    /// Up statements are running (or a run crashed midway)
    ApplyingUp,
    /// Up statements completed
    Applied,
    /// Down statements are running (or a run crashed midway)
    ApplyingDown,
    /// The last attempt in the given direction failed
    Inconsistent(Direction),
}

impl EvolutionState {
    pub fn applying(direction: Direction) -> Self {
        match direction {
            Direction::Up => EvolutionState::ApplyingUp,
            Direction::Down => EvolutionState::ApplyingDown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EvolutionState::ApplyingUp => "applying_up",
            EvolutionState::Applied => "applied",
            EvolutionState::ApplyingDown => "applying_down",
            EvolutionState::Inconsistent(Direction::Up) => "inconsistent_up",
            EvolutionState::Inconsistent(Direction::Down) => "inconsistent_down",
        }
    }

    /// Anything but `Applied` blocks automatic reconciliation
    pub fn is_blocking(&self) -> bool {
        !matches!(self, EvolutionState::Applied)
    }

    /// Direction of the unfinished or failed attempt, if any
    pub fn unfinished_direction(&self) -> Option<Direction> {
        match self {
            EvolutionState::ApplyingUp => Some(Direction::Up),
            EvolutionState::ApplyingDown => Some(Direction::Down),
            EvolutionState::Inconsistent(direction) => Some(*direction),
            EvolutionState::Applied => None,
        }
    }
}

impl fmt::Display for EvolutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<EvolutionState> for String {
    fn from(state: EvolutionState) -> Self {
        state.as_str().to_string()
    }
}

impl FromStr for EvolutionState {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "applying_up" => Ok(EvolutionState::ApplyingUp),
            "applied" => Ok(EvolutionState::Applied),
            "applying_down" => Ok(EvolutionState::ApplyingDown),
            "inconsistent_up" => Ok(EvolutionState::Inconsistent(Direction::Up)),
            "inconsistent_down" => Ok(EvolutionState::Inconsistent(Direction::Down)),
            other => Err(DbError::ParseError(format!(
                "unknown evolution state '{other}'"
            ))),
        }
    }
}

/// A revision recorded in the meta table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedEvolution {
    pub revision: u32,

    /// Checksum of the script as it was applied
    pub hash: String,

    pub state: EvolutionState,

    /// When the row last changed state
    pub applied_at: DateTime<Utc>,

    /// Up SQL as applied (raw, before substitution)
    pub apply_script: String,

    /// Down SQL as applied; reverting always uses this, never the current file
    pub revert_script: String,

    /// Error text of the last failed attempt
    pub last_problem: Option<String>,
}

impl AppliedEvolution {
    /// Row for `script` in `state`, stamped now
    #[must_use]
    pub fn from_script(script: &Script, state: EvolutionState, last_problem: Option<String>) -> Self {
        Self {
            revision: script.revision(),
            hash: script.checksum(),
            state,
            applied_at: Utc::now(),
            apply_script: script.up_sql().to_string(),
            revert_script: script.down_sql().to_string(),
            last_problem,
        }
    }

    /// The script as it was recorded, used to revert this revision
    pub fn recorded_script(&self) -> Script {
        Script::new(self.revision, &self.apply_script, &self.revert_script)
    }

    /// Parse a `TIMESTAMP` rendered as text by PostgreSQL
    pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, DbError> {
        const FORMATS: [&str; 4] = [
            "%Y-%m-%d %H:%M:%S%.f",
            "%Y-%m-%d %H:%M:%S",
            "%Y-%m-%dT%H:%M:%S%.f",
            "%Y-%m-%dT%H:%M:%S",
        ];

        FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
            .map(|naive| naive.and_utc())
            .ok_or_else(|| {
                DbError::ParseError(format!(
                    "Failed to parse timestamp '{value}': unrecognized format"
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_state_round_trips_through_text() {
        for state in [
            EvolutionState::ApplyingUp,
            EvolutionState::Applied,
            EvolutionState::ApplyingDown,
            EvolutionState::Inconsistent(Direction::Up),
            EvolutionState::Inconsistent(Direction::Down),
        ] {
            assert_eq!(state.as_str().parse::<EvolutionState>().unwrap(), state);
        }
        assert!("resolved".parse::<EvolutionState>().is_err());
    }

    #[test]
    fn test_only_applied_is_settled() {
        assert!(!EvolutionState::Applied.is_blocking());
        assert!(EvolutionState::ApplyingUp.is_blocking());
        assert!(EvolutionState::Inconsistent(Direction::Down).is_blocking());
        assert_eq!(
            EvolutionState::Inconsistent(Direction::Down).unfinished_direction(),
            Some(Direction::Down)
        );
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let ts = AppliedEvolution::parse_timestamp("2024-01-20 12:00:00.123456").unwrap();
        assert_eq!((ts.year(), ts.month(), ts.day(), ts.hour()), (2024, 1, 20, 12));
        assert!(AppliedEvolution::parse_timestamp("2024-01-20T12:00:00").is_ok());
        assert!(AppliedEvolution::parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_recorded_script_matches_hash() {
        let script = Script::new(5, "CREATE TABLE a (id int);", "DROP TABLE a;");
        let row = AppliedEvolution::from_script(&script, EvolutionState::Applied, None);
        assert_eq!(row.recorded_script(), script);
        assert_eq!(row.hash, script.checksum());
    }
}
