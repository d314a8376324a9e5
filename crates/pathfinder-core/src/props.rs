//! Typed property multimaps.
//!
//! A [`Props`] is the payload of a published service and the haystack a
//! [`crate::filter::Filter`] is evaluated against: a map from string keys
//! to lists of typed values. Multiple values under one key are ordinary
//! (a service advertising two addresses publishes `addr` twice); a filter
//! leaf is satisfied when *any* value under its key satisfies the
//! relation.
//!
//! On the wire a property map is a JSON object whose values are arrays of
//! strings and integers: `{"name": ["echo"], "port": [4711, 4712]}`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One property value: a 64-bit signed integer or a string.
///
/// Serialized untagged, so the wire form is a bare JSON number or string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropValue {
    /// Integer value. Participates in filter ordering comparisons.
    Int(i64),
    /// String value. Participates in equality and glob matching only.
    Str(String),
}

impl PropValue {
    /// Returns the integer value, if this is an integer.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Str(_) => None,
        }
    }

    /// Returns the string value, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Int(_) => None,
            Self::Str(v) => Some(v),
        }
    }
}

impl From<i64> for PropValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for PropValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for PropValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl std::fmt::Display for PropValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v}"),
        }
    }
}

/// A multimap from property names to typed value lists.
///
/// Keys are kept ordered so snapshots and logs are deterministic. Equality
/// is structural (keys, values, and value order), which is what decides
/// whether a republish actually changed anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Props(BTreeMap<String, Vec<PropValue>>);

impl Props {
    /// Creates an empty property map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a value under `key`, keeping any values already there.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<PropValue>) {
        self.0.entry(key.into()).or_default().push(value.into());
    }

    /// Returns the values under `key`, empty if the key is absent.
    #[must_use]
    pub fn values(&self, key: &str) -> &[PropValue] {
        self.0.get(key).map_or(&[], Vec::as_slice)
    }

    /// Returns `true` if `key` has at least one value.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.get(key).is_some_and(|vs| !vs.is_empty())
    }

    /// Iterates over `(key, values)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[PropValue])> {
        self.0.iter().map(|(k, vs)| (k.as_str(), vs.as_slice()))
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if no properties are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, PropValue)> for Props {
    fn from_iter<I: IntoIterator<Item = (String, PropValue)>>(iter: I) -> Self {
        let mut props = Self::new();
        for (key, value) in iter {
            props.add(key, value);
        }
        props
    }
}

impl std::fmt::Display for Props {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        let mut first = true;
        for (key, values) in self.iter() {
            for value in values {
                if !first {
                    write!(f, ", ")?;
                }
                first = false;
                write!(f, "{key}={value}")?;
            }
        }
        write!(f, "}}")
    }
}
