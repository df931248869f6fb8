//! URL path patterns used to classify requests.

use serde::{Deserialize, Serialize};

use crate::Url;

/// Type of URL pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    /// Exact path match.
    Exact,
    /// Path starts with the pattern.
    Prefix,
    /// Path ends with the pattern.
    Suffix,
    /// Path contains the pattern anywhere.
    Contains,
}

/// A pattern matched against the path component of a URL.
///
/// Query strings and fragments never take part in matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlPattern {
    /// Pattern type.
    pub pattern_type: PatternType,
    /// Pattern string.
    pub pattern: String,
}

impl UrlPattern {
    /// Create an exact match pattern.
    pub fn exact(path: &str) -> Self {
        Self {
            pattern_type: PatternType::Exact,
            pattern: path.to_string(),
        }
    }

    /// Create a prefix match pattern.
    pub fn prefix(prefix: &str) -> Self {
        Self {
            pattern_type: PatternType::Prefix,
            pattern: prefix.to_string(),
        }
    }

    /// Create a suffix match pattern.
    pub fn suffix(suffix: &str) -> Self {
        Self {
            pattern_type: PatternType::Suffix,
            pattern: suffix.to_string(),
        }
    }

    /// Create a contains pattern.
    pub fn contains(substring: &str) -> Self {
        Self {
            pattern_type: PatternType::Contains,
            pattern: substring.to_string(),
        }
    }

    /// Check if a path matches this pattern.
    pub fn matches_path(&self, path: &str) -> bool {
        match self.pattern_type {
            PatternType::Exact => path == self.pattern,
            PatternType::Prefix => path.starts_with(&self.pattern),
            PatternType::Suffix => path.ends_with(&self.pattern),
            PatternType::Contains => path.contains(&self.pattern),
        }
    }

    /// Check if a URL's path matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        self.matches_path(url.path())
    }
}

/// True when any pattern in the set matches the URL.
pub fn any_matches(patterns: &[UrlPattern], url: &Url) -> bool {
    patterns.iter().any(|p| p.matches(url))
}
