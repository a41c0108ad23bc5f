//! Search filter tree
//!
//! A tagged filter tree with per-node negation. The same tree renders to an
//! RFC 4515 string for LDAP and evaluates in memory against a
//! [`DirectoryEntry`] for the in-memory directory and replica search.

use serde::{Deserialize, Serialize};

use crate::entry::DirectoryEntry;
use crate::error::{DirectoryError, DirectoryResult};

/// Comparison applied by a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    /// Attribute has a value equal to `value`.
    Equals,
    /// Attribute has a value containing `value`.
    Contains,
    StartsWith,
    EndsWith,
    /// Attribute has a value ordering at or after `value`.
    GreaterOrEqual,
    LessOrEqual,
    /// Attribute has any value; `value` is ignored.
    Present,
}

/// Search filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Filter {
    Leaf {
        attribute: String,
        op: FilterOp,
        #[serde(default)]
        value: String,
        #[serde(default)]
        negate: bool,
    },
    And {
        children: Vec<Filter>,
        #[serde(default)]
        negate: bool,
    },
    Or {
        children: Vec<Filter>,
        #[serde(default)]
        negate: bool,
    },
}

impl Filter {
    fn leaf(attribute: impl Into<String>, op: FilterOp, value: impl Into<String>) -> Self {
        Filter::Leaf {
            attribute: attribute.into(),
            op,
            value: value.into(),
            negate: false,
        }
    }

    /// Create an equals filter.
    pub fn eq(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self::leaf(attribute, FilterOp::Equals, value)
    }

    /// Create a substring filter.
    pub fn contains(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self::leaf(attribute, FilterOp::Contains, value)
    }

    /// Create a prefix filter.
    pub fn starts_with(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self::leaf(attribute, FilterOp::StartsWith, value)
    }

    /// Create a suffix filter.
    pub fn ends_with(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self::leaf(attribute, FilterOp::EndsWith, value)
    }

    /// Create a greater-or-equal filter.
    pub fn ge(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self::leaf(attribute, FilterOp::GreaterOrEqual, value)
    }

    /// Create a less-or-equal filter.
    pub fn le(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self::leaf(attribute, FilterOp::LessOrEqual, value)
    }

    /// Create a presence filter.
    pub fn present(attribute: impl Into<String>) -> Self {
        Self::leaf(attribute, FilterOp::Present, "")
    }

    /// Build a leaf from a wildcard query pattern.
    pub fn pattern(attribute: impl Into<String>, pattern: &QueryPattern) -> Self {
        Self::leaf(attribute, pattern.op, pattern.value.clone())
    }

    pub fn and(children: Vec<Filter>) -> Self {
        Filter::And {
            children,
            negate: false,
        }
    }

    pub fn or(children: Vec<Filter>) -> Self {
        Filter::Or {
            children,
            negate: false,
        }
    }

    /// Flip the negation flag of this node.
    pub fn negated(self) -> Self {
        match self {
            Filter::Leaf {
                attribute,
                op,
                value,
                negate,
            } => Filter::Leaf {
                attribute,
                op,
                value,
                negate: !negate,
            },
            Filter::And { children, negate } => Filter::And {
                children,
                negate: !negate,
            },
            Filter::Or { children, negate } => Filter::Or {
                children,
                negate: !negate,
            },
        }
    }

    /// AND this filter with another, flattening a non-negated AND on the left.
    pub fn and_also(self, other: Filter) -> Self {
        match self {
            Filter::And {
                mut children,
                negate: false,
            } => {
                children.push(other);
                Filter::and(children)
            }
            left => Filter::and(vec![left, other]),
        }
    }

    /// Reject trees that cannot be rendered or evaluated meaningfully.
    pub fn validate(&self) -> DirectoryResult<()> {
        match self {
            Filter::Leaf { attribute, .. } => {
                let valid = !attribute.is_empty()
                    && attribute
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == ';' || c == '.');
                if valid {
                    Ok(())
                } else {
                    Err(DirectoryError::invalid_filter(format!(
                        "invalid attribute description '{attribute}'"
                    )))
                }
            }
            Filter::And { children, .. } | Filter::Or { children, .. } => {
                if children.is_empty() {
                    return Err(DirectoryError::invalid_filter("empty filter set"));
                }
                children.iter().try_for_each(Filter::validate)
            }
        }
    }

    /// Render as an RFC 4515 filter string.
    pub fn to_ldap(&self) -> String {
        let (rendered, negate) = match self {
            Filter::Leaf {
                attribute,
                op,
                value,
                negate,
            } => {
                let value = escape_filter_value(value);
                let body = match op {
                    FilterOp::Equals => format!("({attribute}={value})"),
                    FilterOp::Contains => format!("({attribute}=*{value}*)"),
                    FilterOp::StartsWith => format!("({attribute}={value}*)"),
                    FilterOp::EndsWith => format!("({attribute}=*{value})"),
                    FilterOp::GreaterOrEqual => format!("({attribute}>={value})"),
                    FilterOp::LessOrEqual => format!("({attribute}<={value})"),
                    FilterOp::Present => format!("({attribute}=*)"),
                };
                (body, *negate)
            }
            Filter::And { children, negate } => {
                let inner: String = children.iter().map(Filter::to_ldap).collect();
                (format!("(&{inner})"), *negate)
            }
            Filter::Or { children, negate } => {
                let inner: String = children.iter().map(Filter::to_ldap).collect();
                (format!("(|{inner})"), *negate)
            }
        };
        if negate {
            format!("(!{rendered})")
        } else {
            rendered
        }
    }

    /// Evaluate against an entry. String comparisons ignore case.
    pub fn matches(&self, entry: &DirectoryEntry) -> bool {
        match self {
            Filter::Leaf {
                attribute,
                op,
                value,
                negate,
            } => leaf_matches(entry, attribute, *op, value) != *negate,
            Filter::And { children, negate } => {
                children.iter().all(|c| c.matches(entry)) != *negate
            }
            Filter::Or { children, negate } => children.iter().any(|c| c.matches(entry)) != *negate,
        }
    }
}

fn leaf_matches(entry: &DirectoryEntry, attribute: &str, op: FilterOp, value: &str) -> bool {
    let Some(values) = entry.attributes.get(attribute) else {
        return false;
    };
    if op == FilterOp::Present {
        return !values.is_empty();
    }
    let wanted = value.to_lowercase();
    values.iter().any(|v| {
        let v = v.to_lowercase();
        match op {
            FilterOp::Equals => v == wanted,
            FilterOp::Contains => v.contains(&wanted),
            FilterOp::StartsWith => v.starts_with(&wanted),
            FilterOp::EndsWith => v.ends_with(&wanted),
            FilterOp::GreaterOrEqual => v >= wanted,
            FilterOp::LessOrEqual => v <= wanted,
            FilterOp::Present => true,
        }
    })
}

/// Escape special characters in LDAP filter values (RFC 4515).
pub fn escape_filter_value(value: &str) -> String {
    value
        .replace('\\', "\\5c")
        .replace('*', "\\2a")
        .replace('(', "\\28")
        .replace(')', "\\29")
        .replace('\0', "\\00")
}

/// Escape special characters in DN attribute values per RFC 4514.
pub fn escape_dn_value(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let mut result = String::with_capacity(value.len() * 2);
    for (i, ch) in chars.iter().enumerate() {
        let is_first = i == 0;
        let is_last = i + 1 == chars.len();
        match ch {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
                result.push('\\');
                result.push(*ch);
            }
            '\0' => result.push_str("\\00"),
            ' ' if is_first || is_last => result.push_str("\\20"),
            '#' if is_first => result.push_str("\\23"),
            _ => result.push(*ch),
        }
    }
    result
}

/// A client query string reduced to one comparison.
///
/// `*ada*` is a substring match, `ada*` a prefix, `*ada` a suffix, `ada`
/// exact, and `*` alone means any value. Inner `*` are matched literally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPattern {
    pub op: FilterOp,
    pub value: String,
}

impl QueryPattern {
    pub fn parse(query: &str) -> Self {
        let leading = query.starts_with('*');
        let trailing = query.ends_with('*');
        let value = query.trim_matches('*').to_string();
        let op = match (leading, trailing) {
            _ if value.is_empty() => FilterOp::Present,
            (true, true) => FilterOp::Contains,
            (false, true) => FilterOp::StartsWith,
            (true, false) => FilterOp::EndsWith,
            (false, false) => FilterOp::Equals,
        };
        Self { op, value }
    }

    /// Whether the pattern accepts every value.
    pub fn is_match_all(&self) -> bool {
        self.op == FilterOp::Present
    }
}
