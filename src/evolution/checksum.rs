//! Checksum calculation for evolution scripts

use sha2::{Digest, Sha256};

const CHECKSUM_HEX_LEN: usize = 64;

/// Calculate the SHA-256 checksum of an evolution's content
///
/// Both sections are trimmed first, so re-indenting a file or adding blank
/// lines around a section does not register as a change. The down section is
/// hashed first, followed by a NUL separator and the up section.
///
/// # Returns
///
/// Returns the lowercase hexadecimal SHA-256 digest
pub fn script_checksum(up_sql: &str, down_sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(down_sql.trim().as_bytes());
    hasher.update([0u8]);
    hasher.update(up_sql.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Whether `hash` has the shape of a checksum produced by [`script_checksum`]
pub fn is_checksum_format(hash: &str) -> bool {
    hash.len() == CHECKSUM_HEX_LEN && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Compare a stored checksum with the one calculated from the current script
pub fn checksum_matches(stored_checksum: &str, current_checksum: &str) -> bool {
    stored_checksum.eq_ignore_ascii_case(current_checksum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_hex_sha256() {
        let checksum = script_checksum("CREATE TABLE a (id int);", "DROP TABLE a;");
        assert_eq!(checksum.len(), 64);
        assert!(checksum.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_checksum_ignores_surrounding_whitespace() {
        assert_eq!(
            script_checksum("CREATE TABLE a (id int);", "DROP TABLE a;"),
            script_checksum("\n  CREATE TABLE a (id int);\n\n", "DROP TABLE a;   ")
        );
    }

    #[test]
    fn test_checksum_separates_sections() {
        // moving text across the section boundary is a different evolution
        assert_ne!(script_checksum("b", "a"), script_checksum("", "ab"));
    }

    #[test]
    fn test_checksum_format() {
        assert!(is_checksum_format(&script_checksum("a", "b")));
        assert!(is_checksum_format(&script_checksum("a", "b").to_uppercase()));
        // 40 hex digits, as written by other tools sharing the table name
        assert!(!is_checksum_format("da39a3ee5e6b4b0d3255bfef95601890afd80709"));
        assert!(!is_checksum_format(&"z".repeat(64)));
        assert!(!is_checksum_format(""));
    }

    #[test]
    fn test_checksum_matches_is_case_insensitive() {
        assert!(checksum_matches("ABCDEF", "abcdef"));
        assert!(!checksum_matches("abcdef", "abcdee"));
    }
}
