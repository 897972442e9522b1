//! `Script` - one versioned evolution with its up and down SQL

use crate::evolution::checksum::script_checksum;
use serde::Serialize;
use std::fmt;

/// Which half of an evolution runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Forward (`!Ups`) statements
    Up,
    /// Reverse (`!Downs`) statements
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable evolution: revision number plus forward and reverse SQL
///
/// Revisions are unique within one database's script set and scripts are
/// ordered by revision ascending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Script {
    revision: u32,
    up_sql: String,
    down_sql: String,
}

impl Script {
    #[must_use]
    pub fn new(revision: u32, up_sql: impl Into<String>, down_sql: impl Into<String>) -> Self {
        Self {
            revision,
            up_sql: up_sql.into(),
            down_sql: down_sql.into(),
        }
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn up_sql(&self) -> &str {
        &self.up_sql
    }

    pub fn down_sql(&self) -> &str {
        &self.down_sql
    }

    /// SQL for the given direction
    pub fn sql(&self, direction: Direction) -> &str {
        match direction {
            Direction::Up => &self.up_sql,
            Direction::Down => &self.down_sql,
        }
    }

    /// Content checksum, compared against the hash recorded when the script was applied
    pub fn checksum(&self) -> String {
        script_checksum(&self.up_sql, &self.down_sql)
    }
}
