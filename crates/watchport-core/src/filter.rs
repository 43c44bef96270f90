//! Attach filters.
//!
//! A filter is a caller-supplied pattern tested against process names. We
//! try to compile each pattern as a regex; if compilation fails the filter
//! degrades to plain substring containment against the raw string, logged
//! as a warning rather than an error, so the agent stays usable even with
//! an unsupported pattern.

use regex::Regex;
use tracing::warn;

/// Case policy for filter matching.
///
/// Applies to both the compiled-regex and the substring-fallback paths.
/// The default is case-sensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchCase
{
    /// Patterns match exactly as written.
    #[default]
    Sensitive,
    /// Patterns match regardless of ASCII/Unicode case.
    Insensitive,
}

/// One attach filter: the raw pattern plus, when it compiled, the regex
/// matcher. `matcher` being `None` means substring fallback.
#[derive(Debug, Clone)]
pub struct Filter
{
    raw: String,
    matcher: Option<Regex>,
    case: MatchCase,
}

impl Filter
{
    /// Build a filter from a pattern. Never fails: an uncompilable
    /// pattern degrades to substring matching.
    #[must_use]
    pub fn new(pattern: impl Into<String>, case: MatchCase) -> Filter
    {
        let raw = pattern.into();
        let source = match case {
            MatchCase::Sensitive => raw.clone(),
            MatchCase::Insensitive => format!("(?i){raw}"),
        };
        let matcher = match Regex::new(&source) {
            Ok(regex) => Some(regex),
            Err(err) => {
                warn!(pattern = %raw, %err, "filter did not compile; degrading to substring match");
                None
            }
        };
        Filter { raw, matcher, case }
    }

    /// The raw pattern string as supplied.
    #[must_use]
    pub fn pattern(&self) -> &str
    {
        &self.raw
    }

    /// Whether the filter compiled as a regex (false means substring
    /// fallback).
    #[must_use]
    pub fn is_compiled(&self) -> bool
    {
        self.matcher.is_some()
    }

    /// Test a process name against the filter.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool
    {
        match &self.matcher {
            Some(regex) => regex.is_match(name),
            None => match self.case {
                MatchCase::Sensitive => name.contains(&self.raw),
                MatchCase::Insensitive => name.to_lowercase().contains(&self.raw.to_lowercase()),
            },
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_compiled_pattern_matches()
    {
        let filter = Filter::new("^net.*d$", MatchCase::Sensitive);
        assert!(filter.is_compiled());
        assert!(filter.matches("netstackd"));
        assert!(!filter.matches("netstack"));
    }

    #[test]
    fn test_invalid_pattern_degrades_to_substring()
    {
        let filter = Filter::new("fs[", MatchCase::Sensitive);
        assert!(!filter.is_compiled());
        assert!(filter.matches("minfs[0]"));
        assert!(!filter.matches("minfs"));
    }

    #[test]
    fn test_case_sensitive_by_default()
    {
        let filter = Filter::new("True", MatchCase::default());
        assert!(filter.matches("True"));
        assert!(!filter.matches("true"));
    }

    #[test]
    fn test_case_insensitive_regex()
    {
        let filter = Filter::new("true", MatchCase::Insensitive);
        assert!(filter.is_compiled());
        assert!(filter.matches("TRUE"));
        assert!(filter.matches("a-True-b"));
    }

    #[test]
    fn test_case_insensitive_substring_fallback()
    {
        let filter = Filter::new("Sh[", MatchCase::Insensitive);
        assert!(!filter.is_compiled());
        assert!(filter.matches("crash[handler]".to_uppercase().as_str()));
        assert!(filter.matches("crASh[handler]"));
        assert!(!filter.matches("crash-handler"));
    }

    #[test]
    fn test_substring_matches_anywhere()
    {
        let filter = Filter::new("t", MatchCase::Sensitive);
        assert!(filter.matches("true"));
        assert!(filter.matches("cat"));
        assert!(!filter.matches("frog"));
    }
}
