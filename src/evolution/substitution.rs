//! Variable substitution in script bodies
//!
//! `<prefix>{name}` is replaced by the mapping for `name`. With escaping
//! enabled, `<prefix>{!name}` is emitted as the literal `<prefix>{name}`.
//! Substitution happens at execution time only; stored scripts and checksums
//! always use the raw text.

use crate::evolution::error::EvolutionError;
use regex::{Captures, Regex};
use serde::Deserialize;
use std::collections::HashMap;

fn default_prefix() -> String {
    "$".to_string()
}

/// Variables to substitute into script bodies
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubstitutionContext {
    /// Variable name (without prefix and braces) to replacement
    #[serde(default)]
    pub mappings: HashMap<String, String>,
    /// Prefix in front of the braces, `$` by default
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Whether `<prefix>{!name}` escapes a variable
    #[serde(default, rename = "escape")]
    pub escape_enabled: bool,
}

impl Default for SubstitutionContext {
    fn default() -> Self {
        Self {
            mappings: HashMap::new(),
            prefix: default_prefix(),
            escape_enabled: false,
        }
    }
}

impl SubstitutionContext {
    pub fn new(mappings: HashMap<String, String>, prefix: impl Into<String>, escape_enabled: bool) -> Self {
        Self {
            mappings,
            prefix: prefix.into(),
            escape_enabled,
        }
    }

    /// Add one mapping
    #[must_use]
    pub fn with_mapping(mut self, name: impl Into<String>, replacement: impl Into<String>) -> Self {
        self.mappings.insert(name.into(), replacement.into());
        self
    }

    /// Whether applying this context can change any text
    pub fn is_noop(&self) -> bool {
        self.mappings.is_empty() && !self.escape_enabled
    }

    /// Substitute variables in `sql`
    ///
    /// Unknown variables are left untouched.
    ///
    /// # Example
    ///
    /// ```
    /// use evolutions::evolution::SubstitutionContext;
    ///
    /// let ctx = SubstitutionContext::default().with_mapping("name", "widgets");
    /// let ctx = SubstitutionContext { escape_enabled: true, ..ctx };
    /// assert_eq!(
    ///     ctx.apply("create table ${name} (${!name} int)").unwrap(),
    ///     "create table widgets (${name} int)"
    /// );
    /// ```
    pub fn apply(&self, sql: &str) -> Result<String, EvolutionError> {
        if self.is_noop() {
            return Ok(sql.to_string());
        }

        let pattern = format!(r"{}\{{(.*?)\}}", regex::escape(&self.prefix));
        let re = Regex::new(&pattern).map_err(|e| {
            EvolutionError::Config(format!(
                "invalid substitution prefix '{}': {e}",
                self.prefix
            ))
        })?;

        let replaced = re.replace_all(sql, |caps: &Captures<'_>| {
            let name = &caps[1];
            if self.escape_enabled {
                if let Some(escaped) = name.strip_prefix('!') {
                    return format!("{}{{{}}}", self.prefix, escaped);
                }
            }
            match self.mappings.get(name) {
                Some(replacement) => replacement.clone(),
                None => caps[0].to_string(),
            }
        });

        Ok(replaced.into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widgets(escape_enabled: bool) -> SubstitutionContext {
        SubstitutionContext {
            escape_enabled,
            ..SubstitutionContext::default().with_mapping("name", "widgets")
        }
    }

    #[test]
    fn test_substitutes_and_escapes() {
        assert_eq!(
            widgets(true).apply("create table ${name} (${!name} int)").unwrap(),
            "create table widgets (${name} int)"
        );
    }

    #[test]
    fn test_escape_form_untouched_when_escaping_disabled() {
        assert_eq!(
            widgets(false).apply("create table ${name} (${!name} int)").unwrap(),
            "create table widgets (${!name} int)"
        );
    }

    #[test]
    fn test_unknown_variables_are_left_alone() {
        assert_eq!(
            widgets(false).apply("select '${missing}' from ${name}").unwrap(),
            "select '${missing}' from widgets"
        );
    }

    #[test]
    fn test_custom_prefix_is_matched_literally() {
        let ctx = SubstitutionContext::new(
            HashMap::from([("schema".to_string(), "tenant_a".to_string())]),
            "#!",
            false,
        );
        assert_eq!(
            ctx.apply("create table #!{schema}.users (id int); -- ${schema}").unwrap(),
            "create table tenant_a.users (id int); -- ${schema}"
        );
    }

    #[test]
    fn test_regex_metacharacters_in_prefix() {
        let ctx = SubstitutionContext::new(
            HashMap::from([("t".to_string(), "x".to_string())]),
            ".*",
            false,
        );
        assert_eq!(ctx.apply("a.*{t} b${t}").unwrap(), "ax b${t}");
    }

    #[test]
    fn test_noop_context_returns_input() {
        let ctx = SubstitutionContext::default();
        assert!(ctx.is_noop());
        assert_eq!(ctx.apply("select '${x}'").unwrap(), "select '${x}'");
    }
}
