//! Subscription filter compilation and matching.
//!
//! Filters arrive as LDAP-shaped text, e.g. `(&(name=echo*)(port>1023))`,
//! and compile to a tree of nodes evaluated against a [`Props`] multimap.
//! Supported shapes:
//!
//! - `(key=value)` equality, with `*` substring-glob wildcards in the value
//! - `(key=*)` presence
//! - `(key>N)` / `(key>=N)` / `(key<N)` / `(key<=N)` integer comparisons
//! - `(&(f)(f)...)` conjunction, `(|(f)(f)...)` disjunction, `(!(f))`
//!   negation
//!
//! The metacharacters `( ) & | ! = < > * \` may be escaped with a
//! backslash in keys and values.
//!
//! A leaf is satisfied when *any* value under its key satisfies the
//! relation. Integer comparisons fail on string candidates and string
//! globs fail on integer candidates; a wildcard-free equality value that
//! parses as an integer matches both the equal integer and the equal
//! string spelling.
//!
//! Compilation counts nodes; the count is the admission charge for the
//! `subscription_filter_nodes` resource and is capped per subscription.

mod parser;

#[cfg(test)]
mod tests;

use thiserror::Error;

use crate::props::{PropValue, Props};

/// Error compiling a filter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    /// The filter text does not parse.
    #[error("filter syntax error at offset {offset}: {reason}")]
    Syntax {
        /// Byte offset of the offending character.
        offset: usize,
        /// What the parser expected.
        reason: &'static str,
    },

    /// The compiled tree exceeds the per-subscription complexity cap.
    #[error("filter too complex: {nodes} nodes exceeds maximum {max}")]
    TooComplex {
        /// Node count of the compiled tree.
        nodes: usize,
        /// The configured cap.
        max: usize,
    },
}

/// A compiled filter tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// `(key=*)` - the key has at least one value.
    Present {
        /// Property key.
        key: String,
    },
    /// `(key=value)` - some value under the key equals the pattern.
    Equal {
        /// Property key.
        key: String,
        /// Literal or glob pattern.
        pattern: ValuePattern,
    },
    /// `(key>N)` - some integer value under the key is strictly greater.
    Greater {
        /// Property key.
        key: String,
        /// Comparison bound.
        limit: i64,
    },
    /// `(key>=N)`.
    GreaterEq {
        /// Property key.
        key: String,
        /// Comparison bound.
        limit: i64,
    },
    /// `(key<N)`.
    Less {
        /// Property key.
        key: String,
        /// Comparison bound.
        limit: i64,
    },
    /// `(key<=N)`.
    LessEq {
        /// Property key.
        key: String,
        /// Comparison bound.
        limit: i64,
    },
    /// `(&(f)(f)...)` - all subfilters are satisfied.
    And(Vec<Filter>),
    /// `(|(f)(f)...)` - at least one subfilter is satisfied.
    Or(Vec<Filter>),
    /// `(!(f))` - the subfilter is not satisfied.
    Not(Box<Filter>),
}

impl Filter {
    /// Compiles filter text into a tree.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Syntax`] when the text does not parse. The
    /// complexity cap is the caller's concern (see [`Filter::node_count`]);
    /// parsing itself is linear in the input.
    pub fn parse(text: &str) -> Result<Self, FilterError> {
        parser::parse(text)
    }

    /// Number of nodes in the tree, composites included.
    ///
    /// This is the resource charge of a subscription carrying this filter.
    #[must_use]
    pub fn node_count(&self) -> usize {
        match self {
            Self::Present { .. }
            | Self::Equal { .. }
            | Self::Greater { .. }
            | Self::GreaterEq { .. }
            | Self::Less { .. }
            | Self::LessEq { .. } => 1,
            Self::And(subs) | Self::Or(subs) => {
                1 + subs.iter().map(Self::node_count).sum::<usize>()
            },
            Self::Not(sub) => 1 + sub.node_count(),
        }
    }

    /// Evaluates the tree against a property multimap.
    #[must_use]
    pub fn matches(&self, props: &Props) -> bool {
        match self {
            Self::Present { key } => props.contains_key(key),
            Self::Equal { key, pattern } => {
                props.values(key).iter().any(|v| pattern.matches(v))
            },
            Self::Greater { key, limit } => int_values(props, key).any(|v| v > *limit),
            Self::GreaterEq { key, limit } => int_values(props, key).any(|v| v >= *limit),
            Self::Less { key, limit } => int_values(props, key).any(|v| v < *limit),
            Self::LessEq { key, limit } => int_values(props, key).any(|v| v <= *limit),
            Self::And(subs) => subs.iter().all(|f| f.matches(props)),
            Self::Or(subs) => subs.iter().any(|f| f.matches(props)),
            Self::Not(sub) => !sub.matches(props),
        }
    }
}

fn int_values<'a>(props: &'a Props, key: &str) -> impl Iterator<Item = i64> + 'a {
    props.values(key).iter().filter_map(PropValue::as_int)
}

/// The right-hand side of an equality leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValuePattern {
    /// A wildcard-free value.
    Literal {
        /// The literal text, escapes resolved.
        text: String,
        /// The integer spelling of the text, when it has one.
        int_value: Option<i64>,
    },
    /// A value containing `*` wildcards; matches strings only.
    Glob(GlobPattern),
}

impl ValuePattern {
    pub(crate) fn literal(text: String) -> Self {
        let int_value = text.parse().ok();
        Self::Literal { text, int_value }
    }

    fn matches(&self, value: &PropValue) -> bool {
        match (self, value) {
            (Self::Literal { text, .. }, PropValue::Str(s)) => s == text,
            (Self::Literal { int_value, .. }, PropValue::Int(i)) => *int_value == Some(*i),
            (Self::Glob(glob), PropValue::Str(s)) => glob.matches(s),
            (Self::Glob(_), PropValue::Int(_)) => false,
        }
    }
}

/// A `*`-wildcard pattern with substring-glob semantics.
///
/// `*` matches any (possibly empty) substring. The pattern is stored as
/// its literal segments plus whether the first and last segments are
/// anchored to the start and end of the candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobPattern {
    segments: Vec<String>,
    anchored_start: bool,
    anchored_end: bool,
}

impl GlobPattern {
    pub(crate) fn new(segments: Vec<String>, anchored_start: bool, anchored_end: bool) -> Self {
        Self {
            segments,
            anchored_start,
            anchored_end,
        }
    }

    /// Returns `true` if the pattern matches the whole of `text`.
    #[must_use]
    pub fn matches(&self, text: &str) -> bool {
        let mut segments = self.segments.as_slice();
        let mut haystack = text;

        if self.anchored_start {
            let Some((first, rest)) = segments.split_first() else {
                return text.is_empty();
            };
            let Some(stripped) = haystack.strip_prefix(first.as_str()) else {
                return false;
            };
            haystack = stripped;
            segments = rest;
        }

        if self.anchored_end {
            let Some((last, rest)) = segments.split_last() else {
                // Pattern was a single segment consumed by the start
                // anchor: the remainder must be empty.
                return haystack.is_empty();
            };
            let Some(stripped) = haystack.strip_suffix(last.as_str()) else {
                return false;
            };
            haystack = stripped;
            segments = rest;
        }

        // Remaining segments float: each must occur after the previous,
        // leftmost-first.
        for segment in segments {
            match haystack.find(segment.as_str()) {
                Some(idx) => haystack = &haystack[idx + segment.len()..],
                None => return false,
            }
        }
        true
    }
}
