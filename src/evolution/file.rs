//! Evolution script files
//!
//! Each revision lives in its own file named `<prefix><revision>.sql`, split
//! into a forward and a reverse section by marker comments:
//!
//! ```sql
//! # --- !Ups
//! CREATE TABLE widgets (id bigint PRIMARY KEY, name varchar(255));
//!
//! # --- !Downs
//! DROP TABLE widgets;
//! ```
//!
//! `--` works as well as `#` for the marker lines. Anything above the first
//! marker is ignored.

use crate::evolution::error::ReadError;
use crate::evolution::Script;
use regex::Regex;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Ups,
    Downs,
}

/// Parse the content of one evolution file
///
/// # Errors
///
/// Returns `ReadError::MissingMarker` when either section marker is absent and
/// `ReadError::DuplicateMarker` when one appears twice.
pub fn parse_script(revision: u32, content: &str, script_name: &str) -> Result<Script, ReadError> {
    let marker = Regex::new(r"(?i)^\s*(?:#|--).*!(ups|downs)\b").map_err(|e| {
        ReadError::InvalidFormat {
            script: script_name.to_string(),
            reason: format!("invalid marker pattern: {e}"),
        }
    })?;

    let mut ups: Option<Vec<&str>> = None;
    let mut downs: Option<Vec<&str>> = None;
    let mut section = Section::Preamble;

    for line in content.lines() {
        if let Some(caps) = marker.captures(line) {
            let (target, name, next) = if caps[1].eq_ignore_ascii_case("ups") {
                (&mut ups, "Ups", Section::Ups)
            } else {
                (&mut downs, "Downs", Section::Downs)
            };
            if target.is_some() {
                return Err(ReadError::DuplicateMarker {
                    script: script_name.to_string(),
                    marker: name,
                });
            }
            *target = Some(Vec::new());
            section = next;
            continue;
        }

        match section {
            Section::Preamble => {}
            Section::Ups => ups.get_or_insert_with(Vec::new).push(line),
            Section::Downs => downs.get_or_insert_with(Vec::new).push(line),
        }
    }

    let ups = ups.ok_or_else(|| ReadError::MissingMarker {
        script: script_name.to_string(),
        marker: "Ups",
    })?;
    let downs = downs.ok_or_else(|| ReadError::MissingMarker {
        script: script_name.to_string(),
        marker: "Downs",
    })?;

    Ok(Script::new(
        revision,
        ups.join("\n").trim(),
        downs.join("\n").trim(),
    ))
}

/// Extract the revision from a file name of the form `<prefix><revision>.sql`
///
/// Returns `Ok(None)` for files that do not follow the convention, so unrelated
/// files can sit next to the evolutions.
///
/// # Example
/// - `12.sql` with prefix `""` → `Some(12)`
/// - `tenant_3.sql` with prefix `"tenant_"` → `Some(3)`
/// - `README.md` → `None`
pub fn parse_filename(filename: &str, prefix: &str) -> Result<Option<u32>, ReadError> {
    let pattern = format!(r"^{}(\d+)\.sql$", regex::escape(prefix));
    let re = Regex::new(&pattern).map_err(|e| ReadError::InvalidFormat {
        script: filename.to_string(),
        reason: format!("invalid file name pattern: {e}"),
    })?;

    let Some(caps) = re.captures(filename) else {
        return Ok(None);
    };

    let digits = &caps[1];
    digits
        .parse::<u32>()
        .map(Some)
        .map_err(|e| ReadError::InvalidFormat {
            script: filename.to_string(),
            reason: format!("revision '{digits}' is not a valid revision number: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_script_sections() {
        let content = "\
# Users schema

# --- !Ups
CREATE TABLE users (id bigint PRIMARY KEY);
CREATE INDEX users_id ON users (id);

# --- !Downs
DROP TABLE users;
";
        let script = parse_script(1, content, "1.sql").unwrap();
        assert_eq!(script.revision(), 1);
        assert_eq!(
            script.up_sql(),
            "CREATE TABLE users (id bigint PRIMARY KEY);\nCREATE INDEX users_id ON users (id);"
        );
        assert_eq!(script.down_sql(), "DROP TABLE users;");
    }

    #[test]
    fn test_parse_script_accepts_dash_markers_in_any_case() {
        let content = "-- !ups\nCREATE TABLE a (id int);\n-- !DOWNS\nDROP TABLE a;";
        let script = parse_script(4, content, "4.sql").unwrap();
        assert_eq!(script.up_sql(), "CREATE TABLE a (id int);");
        assert_eq!(script.down_sql(), "DROP TABLE a;");
    }

    #[test]
    fn test_parse_script_allows_empty_downs() {
        let content = "# --- !Ups\nINSERT INTO a VALUES (1);\n# --- !Downs\n";
        let script = parse_script(2, content, "2.sql").unwrap();
        assert_eq!(script.down_sql(), "");
    }

    #[test]
    fn test_parse_script_missing_downs_marker() {
        let err = parse_script(1, "# --- !Ups\nCREATE TABLE a (id int);", "1.sql").unwrap_err();
        assert_eq!(
            err,
            ReadError::MissingMarker {
                script: "1.sql".to_string(),
                marker: "Downs"
            }
        );
    }

    #[test]
    fn test_parse_script_missing_ups_marker() {
        let err = parse_script(1, "CREATE TABLE a (id int);\n# --- !Downs\n", "1.sql").unwrap_err();
        assert!(matches!(err, ReadError::MissingMarker { marker: "Ups", .. }));
    }

    #[test]
    fn test_parse_script_duplicate_marker() {
        let content = "# --- !Ups\nA;\n# --- !Ups\nB;\n# --- !Downs\n";
        let err = parse_script(1, content, "1.sql").unwrap_err();
        assert!(matches!(err, ReadError::DuplicateMarker { marker: "Ups", .. }));
    }

    #[test]
    fn test_parse_filename() {
        assert_eq!(parse_filename("12.sql", "").unwrap(), Some(12));
        assert_eq!(parse_filename("tenant_3.sql", "tenant_").unwrap(), Some(3));
        assert_eq!(parse_filename("3.sql", "tenant_").unwrap(), None);
        assert_eq!(parse_filename("README.md", "").unwrap(), None);
        assert_eq!(parse_filename("1.sql.bak", "").unwrap(), None);
    }

    #[test]
    fn test_parse_filename_escapes_prefix() {
        assert_eq!(parse_filename("v.1.sql", "v.").unwrap(), Some(1));
        assert_eq!(parse_filename("vx1.sql", "v.").unwrap(), None);
    }

    #[test]
    fn test_parse_filename_rejects_overflow() {
        assert!(parse_filename("99999999999.sql", "").is_err());
    }
}
