//! Script readers
//!
//! A reader returns the full, ordered set of scripts for a named database.
//! Which reader produced the scripts is irrelevant downstream: the simple and
//! the directory reader build identical `Script` values from equivalent input.

use crate::evolution::error::ReadError;
use crate::evolution::file::{parse_filename, parse_script};
use crate::evolution::Script;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the database used when none is configured
pub const DEFAULT_DATABASE: &str = "default";

/// Source of evolution scripts
pub trait EvolutionsReader {
    /// Read all scripts for `database`, sorted by revision ascending
    ///
    /// # Errors
    ///
    /// Returns `ReadError` if the source is malformed or contains duplicate revisions.
    fn read(&self, database: &str) -> Result<Vec<Script>, ReadError>;
}

impl<R: EvolutionsReader + ?Sized> EvolutionsReader for &R {
    fn read(&self, database: &str) -> Result<Vec<Script>, ReadError> {
        (**self).read(database)
    }
}

/// Sort scripts by revision and reject duplicates
pub(crate) fn sorted_unique(database: &str, mut scripts: Vec<Script>) -> Result<Vec<Script>, ReadError> {
    scripts.sort_by_key(Script::revision);
    if let Some(pair) = scripts.windows(2).find(|w| w[0].revision() == w[1].revision()) {
        return Err(ReadError::DuplicateRevision {
            database: database.to_string(),
            revision: pair[0].revision(),
        });
    }
    Ok(scripts)
}

/// Reader over an in-memory map of database name to scripts
///
/// # Example
///
/// ```
/// use evolutions::evolution::{EvolutionsReader, Script, SimpleEvolutionsReader};
///
/// let reader = SimpleEvolutionsReader::for_default([
///     Script::new(1, "CREATE TABLE users (id bigint);", "DROP TABLE users;"),
/// ]);
/// assert_eq!(reader.read("default").unwrap().len(), 1);
/// assert!(reader.read("analytics").unwrap().is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct SimpleEvolutionsReader {
    evolutions: HashMap<String, Vec<Script>>,
}

impl SimpleEvolutionsReader {
    pub fn new(evolutions: HashMap<String, Vec<Script>>) -> Self {
        Self { evolutions }
    }

    /// Reader holding `scripts` for the `default` database
    pub fn for_default(scripts: impl IntoIterator<Item = Script>) -> Self {
        Self::default().with_database(DEFAULT_DATABASE, scripts)
    }

    /// Add (or replace) the scripts of one database
    #[must_use]
    pub fn with_database(
        mut self,
        database: impl Into<String>,
        scripts: impl IntoIterator<Item = Script>,
    ) -> Self {
        self.evolutions
            .insert(database.into(), scripts.into_iter().collect());
        self
    }
}

impl EvolutionsReader for SimpleEvolutionsReader {
    fn read(&self, database: &str) -> Result<Vec<Script>, ReadError> {
        let scripts = self.evolutions.get(database).cloned().unwrap_or_default();
        sorted_unique(database, scripts)
    }
}

/// Reader over `<root>/<database>/<prefix><revision>.sql` files
///
/// A missing database directory reads as an empty set; files that do not
/// follow the naming convention are skipped.
#[derive(Debug, Clone)]
pub struct DirectoryEvolutionsReader {
    root: PathBuf,
    prefix: String,
}

impl DirectoryEvolutionsReader {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            prefix: String::new(),
        }
    }

    /// Only read files named `<prefix><revision>.sql`
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Directory holding the scripts of `database`
    pub fn database_dir(&self, database: &str) -> PathBuf {
        self.root.join(database)
    }
}

impl EvolutionsReader for DirectoryEvolutionsReader {
    fn read(&self, database: &str) -> Result<Vec<Script>, ReadError> {
        if database.is_empty()
            || database.contains(['/', '\\'])
            || matches!(database, "." | "..")
        {
            return Err(ReadError::InvalidFormat {
                script: database.to_string(),
                reason: "database name must be a single path component".to_string(),
            });
        }

        let dir = self.database_dir(database);
        if !dir.exists() {
            log::debug!("No evolutions directory at {}", dir.display());
            return Ok(Vec::new());
        }
        if !dir.is_dir() {
            return Err(ReadError::Io {
                path: dir.display().to_string(),
                reason: "not a directory".to_string(),
            });
        }

        let io_error = |path: &Path, e: std::io::Error| ReadError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        };

        let mut scripts = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| io_error(&dir, e))? {
            let path = entry.map_err(|e| io_error(&dir, e))?.path();
            if !path.is_file() {
                continue;
            }
            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(revision) = parse_filename(filename, &self.prefix)? else {
                continue;
            };

            let content = fs::read_to_string(&path).map_err(|e| io_error(&path, e))?;
            scripts.push(parse_script(revision, &content, &path.display().to_string())?);
        }

        sorted_unique(database, scripts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_reader_sorts_by_revision() {
        let reader = SimpleEvolutionsReader::for_default([
            Script::new(3, "C;", ""),
            Script::new(1, "A;", ""),
            Script::new(2, "B;", ""),
        ]);
        let revisions: Vec<u32> = reader
            .read("default")
            .unwrap()
            .iter()
            .map(Script::revision)
            .collect();
        assert_eq!(revisions, vec![1, 2, 3]);
    }

    #[test]
    fn test_simple_reader_rejects_duplicates() {
        let reader = SimpleEvolutionsReader::for_default([
            Script::new(1, "A;", ""),
            Script::new(1, "B;", ""),
        ]);
        assert_eq!(
            reader.read("default").unwrap_err(),
            ReadError::DuplicateRevision {
                database: "default".to_string(),
                revision: 1
            }
        );
    }

    #[test]
    fn test_simple_reader_keeps_databases_apart() {
        let reader = SimpleEvolutionsReader::default()
            .with_database("orders", [Script::new(1, "A;", "")])
            .with_database("billing", [Script::new(1, "B;", ""), Script::new(2, "C;", "")]);
        assert_eq!(reader.read("orders").unwrap().len(), 1);
        assert_eq!(reader.read("billing").unwrap().len(), 2);
        assert!(reader.read("default").unwrap().is_empty());
    }

    #[test]
    fn test_directory_reader_rejects_path_like_database_names() {
        let reader = DirectoryEvolutionsReader::new("conf/evolutions");
        assert!(reader.read("../etc").is_err());
        assert!(reader.read("..").is_err());
        assert!(reader.read(".").is_err());
        assert!(reader.read("").is_err());
    }
}
