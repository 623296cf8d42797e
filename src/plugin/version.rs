//! Version ordering and single-constraint queries.
//!
//! Versions are dot-separated components. Two components compare
//! numerically when both are all digits and lexicographically otherwise; the
//! shorter version is padded with `"0"` components before comparing.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use super::Plugin;
use crate::errors::PluginError;

pub const VERSION_SEPARATOR: char = '.';

fn is_numeric(component: &str) -> bool {
    !component.is_empty() && component.bytes().all(|b| b.is_ascii_digit())
}

/// Compare two all-digit components without overflowing on long ones.
fn compare_numeric(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn compare_components(a: &str, b: &str) -> Ordering {
    if is_numeric(a) && is_numeric(b) {
        compare_numeric(a, b)
    } else {
        a.cmp(b)
    }
}

/// Total order over version strings.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }

    let mut left = a.split(VERSION_SEPARATOR);
    let mut right = b.split(VERSION_SEPARATOR);
    loop {
        let ordering = match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(x), None) => compare_components(x, "0"),
            (None, Some(y)) => compare_components("0", y),
            (Some(x), Some(y)) => compare_components(x, y),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
}

/// Number of dot-separated components, used to prefer `2.1.0` over `2.1`.
pub fn component_count(version: &str) -> usize {
    version.split(VERSION_SEPARATOR).count()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionOperator {
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = ">=")]
    AtLeast,
    #[serde(rename = "<=")]
    AtMost,
}

impl VersionOperator {
    /// Operators in the order they are tried while parsing.
    pub const ALL: [VersionOperator; 3] = [
        VersionOperator::Equal,
        VersionOperator::AtLeast,
        VersionOperator::AtMost,
    ];

    pub fn token(&self) -> &'static str {
        match self {
            VersionOperator::Equal => "==",
            VersionOperator::AtLeast => ">=",
            VersionOperator::AtMost => "<=",
        }
    }
}

impl fmt::Display for VersionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// A parsed `name<operator>version` constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionQuery {
    pub name: String,
    pub operator: VersionOperator,
    pub version: String,
}

impl VersionQuery {
    fn split(query: &str) -> Option<Self> {
        VersionOperator::ALL.iter().find_map(|operator| {
            let parts: Vec<&str> = query.split(operator.token()).collect();
            match parts.as_slice() {
                [name, version] if !name.is_empty() && !version.is_empty() => Some(Self {
                    name: (*name).to_string(),
                    operator: *operator,
                    version: (*version).to_string(),
                }),
                _ => None,
            }
        })
    }

    /// Parse a constraint. Input without a usable operator becomes an exact
    /// match on the whole token with an empty version.
    pub fn parse(query: &str) -> Self {
        let query = query.trim();
        Self::split(query).unwrap_or_else(|| {
            tracing::debug!(query = query, "No operator in version query, matching by name");
            Self {
                name: query.to_string(),
                operator: VersionOperator::Equal,
                version: String::new(),
            }
        })
    }

    /// Parse a constraint, rejecting anything without an operator and two
    /// non-empty sides.
    pub fn parse_strict(query: &str) -> Result<Self, PluginError> {
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return Err(PluginError::InvalidQuery {
                query: query.to_string(),
                reason: "empty query".to_string(),
            });
        }
        Self::split(trimmed).ok_or_else(|| PluginError::InvalidQuery {
            query: query.to_string(),
            reason: "expected <name>==<version>, <name>>=<version> or <name><=<version>"
                .to_string(),
        })
    }

    /// Whether a version string satisfies this constraint.
    pub fn matches_version(&self, version: &str) -> bool {
        match self.operator {
            VersionOperator::Equal => version == self.version,
            VersionOperator::AtLeast => compare_versions(version, &self.version) != Ordering::Less,
            VersionOperator::AtMost => {
                compare_versions(version, &self.version) != Ordering::Greater
            }
        }
    }

    pub fn matches(&self, plugin: &Plugin) -> bool {
        plugin.name == self.name && self.matches_version(&plugin.version)
    }
}

impl fmt::Display for VersionQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.version.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}{}{}", self.name, self.operator, self.version)
        }
    }
}

/// Split a space-separated query string into its constraint tokens.
pub fn split_query(query: &str) -> impl Iterator<Item = &str> {
    query.split_whitespace()
}
