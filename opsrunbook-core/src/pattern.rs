//! Glob patterns shared by the repository mapping table and the bot
//! identity check.
//!
//! `*` matches any (possibly empty) run of characters and `?` matches exactly
//! one. Every other character, brackets included, is literal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use wildmatch::WildMatch;

/// A glob pattern such as `payments-*` or `*[bot]`.
///
/// Both the case-sensitive and the case-folded matcher are compiled once, when
/// the pattern is built or deserialized.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Glob {
    pattern: String,
    exact: WildMatch,
    folded: WildMatch,
}

impl Glob {
    pub fn new(pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        Self {
            exact: WildMatch::new(&pattern),
            folded: WildMatch::new_case_insensitive(&pattern),
            pattern,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Number of literal characters, used to rank how specific a pattern is.
    /// `orders-api` is more specific than `orders-*`.
    pub fn specificity(&self) -> usize {
        self.pattern.chars().filter(|c| !matches!(c, '*' | '?')).count()
    }

    pub fn matches(&self, value: &str) -> bool {
        self.exact.matches(value)
    }

    pub fn matches_ignore_case(&self, value: &str) -> bool {
        self.folded.matches(value)
    }
}

impl From<String> for Glob {
    fn from(pattern: String) -> Self {
        Self::new(pattern)
    }
}

impl From<Glob> for String {
    fn from(glob: Glob) -> Self {
        glob.pattern
    }
}

impl PartialEq for Glob {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl Eq for Glob {}

impl Hash for Glob {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pattern.hash(state);
    }
}

impl fmt::Debug for Glob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Glob").field(&self.pattern).finish()
    }
}

impl fmt::Display for Glob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exact_match_without_wildcard() {
        let glob = Glob::new("orders-api");
        assert!(glob.matches("orders-api"));
        assert!(!glob.matches("orders-api-v2"));
        assert!(!glob.matches("orders"));
    }

    #[test]
    fn test_prefix_and_suffix_wildcards() {
        assert!(Glob::new("orders-*").matches("orders-api"));
        assert!(Glob::new("orders-*").matches("orders-"));
        assert!(!Glob::new("orders-*").matches("payments-api"));
        assert!(Glob::new("*[bot]").matches("dependabot[bot]"));
        assert!(!Glob::new("*[bot]").matches("dependabot"));
    }

    #[test]
    fn test_inner_wildcards() {
        let glob = Glob::new("prod-*-worker-*");
        assert!(glob.matches("prod-orders-worker-1"));
        assert!(!glob.matches("prod-orders-api-1"));
        assert!(Glob::new("a*b*c").matches("abc"));
        assert!(!Glob::new("a*b*c").matches("acb"));
    }

    #[test]
    fn test_prefix_and_suffix_do_not_overlap() {
        assert!(!Glob::new("ab*ba").matches("aba"));
        assert!(Glob::new("ab*ba").matches("abba"));
    }

    #[test]
    fn test_question_mark_matches_exactly_one_character() {
        let glob = Glob::new("orders-v?");
        assert!(glob.matches("orders-v2"));
        assert!(!glob.matches("orders-v"));
        assert!(!glob.matches("orders-v10"));
        assert_eq!(glob.specificity(), 8);
    }

    #[test]
    fn test_specificity_counts_literal_characters() {
        assert_eq!(Glob::new("orders-api").specificity(), 10);
        assert_eq!(Glob::new("orders-*").specificity(), 7);
        assert_eq!(Glob::new("*").specificity(), 0);
    }

    #[test]
    fn test_case_insensitive_matching() {
        let glob = Glob::new("OpsRunbook-*");
        assert!(glob.matches_ignore_case("opsrunbook-copilot-bot"));
        assert!(!glob.matches("opsrunbook-copilot-bot"));
    }

    #[test]
    fn test_non_ascii_values_do_not_panic() {
        assert!(Glob::new("é*é").matches("éxé"));
        assert!(!Glob::new("é*é").matches("é"));
        assert!(Glob::new("*ü").matches("grüü"));
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let glob: Glob = serde_json::from_str("\"orders-*\"").unwrap();
        assert!(glob.matches("orders-api"));
        assert_eq!(glob, Glob::new("orders-*"));
        assert_eq!(serde_json::to_string(&glob).unwrap(), "\"orders-*\"");
    }

    proptest! {
        #[test]
        fn literal_pattern_matches_only_itself(a in "[a-z0-9-]{0,12}", b in "[a-z0-9-]{0,12}") {
            let glob = Glob::new(a.clone());
            prop_assert!(glob.matches(&a));
            prop_assert_eq!(glob.matches(&b), a == b);
        }

        #[test]
        fn star_suffix_matches_any_extension(prefix in "[a-z-]{0,10}", rest in "\\PC{0,10}") {
            let glob = Glob::new(format!("{}*", prefix));
            let value = format!("{}{}", prefix, rest);
            prop_assert!(glob.matches(&value));
        }

        #[test]
        fn lone_star_matches_everything(value in "\\PC{0,20}") {
            prop_assert!(Glob::new("*").matches(&value));
        }
    }
}
