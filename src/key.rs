//! Structured query keys and their canonical identity.
//!
//! A [`QueryKey`] is an ordered list of segments. Segments are strings, numbers,
//! or flat mappings of named primitives (useful for query parameters):
//!
//! ```
//! use qcache::key::{KeySegment, QueryKey};
//! use qcache::query_key;
//!
//! // /posts              -> ["posts"]
//! // /posts/1            -> ["posts", 1]
//! // /posts?authorId=1   -> ["posts", {"authorId": 1}]
//! // /posts/2/comments   -> ["posts", 2, "comments"]
//! let list = query_key!["posts"];
//! let filtered = query_key!["posts", KeySegment::map([("authorId", 1)])];
//!
//! assert_eq!(list.canonicalize().unwrap(), r#"["posts"]"#);
//! assert_eq!(filtered.canonicalize().unwrap(), r#"["posts",{"authorId":1}]"#);
//! assert!(list.is_prefix_of(&filtered));
//! ```
//!
//! Two keys share an identity iff their canonical strings are equal. Mapping
//! segments are stored sorted by field name, so the order in which fields were
//! supplied never affects identity.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::error::QueryError;

/// A primitive value inside a mapping segment.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum KeyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl KeyValue {
    fn is_well_formed(&self) -> bool {
        match self {
            Self::Float(f) => f.is_finite(),
            _ => true,
        }
    }

    /// Equality as seen by the canonical form: `0.0` and `-0.0` differ.
    fn same_identity(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            _ => self == other,
        }
    }
}

/// Folds `-0.0` into `0.0` so both spell the same key.
fn normalize_zero(value: f64) -> f64 {
    if value == 0.0 { 0.0 } else { value }
}

impl From<bool> for KeyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for KeyValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for KeyValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for KeyValue {
    fn from(value: f64) -> Self {
        Self::Float(normalize_zero(value))
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl<T: Into<KeyValue>> From<Option<T>> for KeyValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// One segment of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum KeySegment {
    Str(String),
    Int(i64),
    Float(f64),
    /// Flat mapping of named primitives. Fields are kept sorted by name.
    Map(BTreeMap<String, KeyValue>),
}

impl KeySegment {
    /// Builds a mapping segment from `(name, value)` pairs in any order.
    pub fn map<K, V>(fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<KeyValue>,
    {
        Self::Map(
            fields
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }

    fn is_well_formed(&self) -> bool {
        match self {
            Self::Float(f) => f.is_finite(),
            Self::Map(fields) => fields.values().all(KeyValue::is_well_formed),
            Self::Str(_) | Self::Int(_) => true,
        }
    }

    fn same_identity(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Map(a), Self::Map(b)) => {
                a.len() == b.len()
                    && a
                        .iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.same_identity(vb))
            }
            _ => self == other,
        }
    }
}

impl From<&str> for KeySegment {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for KeySegment {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for KeySegment {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for KeySegment {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for KeySegment {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for KeySegment {
    fn from(value: f64) -> Self {
        Self::Float(normalize_zero(value))
    }
}

impl From<BTreeMap<String, KeyValue>> for KeySegment {
    fn from(value: BTreeMap<String, KeyValue>) -> Self {
        Self::Map(value)
    }
}

/// A structured identifier for a cached query result.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<KeySegment>);

impl QueryKey {
    /// Creates an empty key. Keys must gain at least one segment before use.
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub const fn from_segments(segments: Vec<KeySegment>) -> Self {
        Self(segments)
    }

    /// Returns this key extended with one more segment.
    #[must_use]
    pub fn with(mut self, segment: impl Into<KeySegment>) -> Self {
        self.0.push(segment.into());
        self
    }

    pub fn segments(&self) -> &[KeySegment] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Checks that the key can be used for lookups.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidKey`] for an empty key or one containing a
    /// non-finite number.
    pub fn validate(&self) -> Result<(), QueryError> {
        if self.0.is_empty() {
            return Err(QueryError::InvalidKey(
                "a query key needs at least one segment".to_string(),
            ));
        }
        if let Some(index) = self.0.iter().position(|s| !s.is_well_formed()) {
            return Err(QueryError::InvalidKey(format!(
                "segment {index} contains a non-finite number"
            )));
        }
        Ok(())
    }

    /// Serializes the key into its canonical string form.
    ///
    /// # Errors
    ///
    /// Fails fast with [`QueryError::InvalidKey`] when the key is malformed.
    pub fn canonicalize(&self) -> Result<String, QueryError> {
        self.validate()?;
        serde_json::to_string(&self.0).map_err(|e| QueryError::InvalidKey(e.to_string()))
    }

    /// Returns `true` if `other` starts with every segment of `self`, in order.
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        self.0.len() <= other.0.len()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|(a, b)| a.same_identity(b))
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

impl From<Vec<KeySegment>> for QueryKey {
    fn from(segments: Vec<KeySegment>) -> Self {
        Self(segments)
    }
}

impl From<&str> for QueryKey {
    fn from(value: &str) -> Self {
        Self(vec![value.into()])
    }
}

impl From<String> for QueryKey {
    fn from(value: String) -> Self {
        Self(vec![value.into()])
    }
}

impl From<&Self> for QueryKey {
    fn from(value: &Self) -> Self {
        value.clone()
    }
}

/// Builds a [`QueryKey`] from a list of segment expressions.
///
/// ```
/// let key = qcache::query_key!["posts", 1, "comments"];
/// assert_eq!(key.len(), 3);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($segment:expr),* $(,)?) => {
        $crate::key::QueryKey::from_segments(vec![$($crate::key::KeySegment::from($segment)),*])
    };
}

/// Canonical string identity of `key`.
///
/// # Errors
///
/// See [`QueryKey::canonicalize`].
pub fn canonicalize(key: &QueryKey) -> Result<String, QueryError> {
    key.canonicalize()
}

/// Matches `key` against `prefix`.
///
/// With `exact` the two keys must be identical; otherwise `key` must start with
/// the segments of `prefix`, so `["posts"]` matches `["posts", 1]`.
pub fn matches(prefix: &QueryKey, key: &QueryKey, exact: bool) -> bool {
    if exact {
        prefix.len() == key.len() && prefix.is_prefix_of(key)
    } else {
        prefix.is_prefix_of(key)
    }
}

/// Selects cache entries for invalidation, refetching, cancellation or removal.
#[derive(Debug, Clone, Default)]
pub struct QueryFilters {
    key: Option<QueryKey>,
    exact: bool,
}

impl QueryFilters {
    /// Matches every entry.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            key: None,
            exact: false,
        }
    }

    /// Matches entries whose key starts with `key`.
    #[must_use]
    pub fn prefix(key: impl Into<QueryKey>) -> Self {
        Self {
            key: Some(key.into()),
            exact: false,
        }
    }

    /// Matches only the entry whose key equals `key`.
    #[must_use]
    pub fn exact(key: impl Into<QueryKey>) -> Self {
        Self {
            key: Some(key.into()),
            exact: true,
        }
    }

    pub fn matches(&self, key: &QueryKey) -> bool {
        self.key
            .as_ref()
            .is_none_or(|prefix| matches(prefix, key, self.exact))
    }
}

impl From<QueryKey> for QueryFilters {
    fn from(key: QueryKey) -> Self {
        Self::prefix(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;

    #[test]
    fn test_canonical_form() {
        let key = query_key!["posts", 1, KeySegment::map([("authorId", 1)])];
        assert_eq!(key.canonicalize().unwrap(), r#"["posts",1,{"authorId":1}]"#);
    }

    #[test]
    fn test_mapping_field_order_does_not_matter() {
        let a = query_key![
            "posts",
            KeySegment::map([
                ("page", KeyValue::from(2)),
                ("authorId", KeyValue::from("ada"))
            ])
        ];
        let b = query_key![
            "posts",
            KeySegment::map([
                ("authorId", KeyValue::from("ada")),
                ("page", KeyValue::from(2))
            ])
        ];
        assert_eq!(canonicalize(&a).unwrap(), canonicalize(&b).unwrap());
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_segment_types_differ() {
        let number = query_key!["posts", 1];
        let string = query_key!["posts", "1"];
        assert_ne!(number.canonicalize().unwrap(), string.canonicalize().unwrap());
    }

    #[test]
    fn test_null_and_optional_values() {
        let key = query_key!["posts", KeySegment::map([("cursor", None::<i64>)])];
        assert_eq!(key.canonicalize().unwrap(), r#"["posts",{"cursor":null}]"#);
    }

    #[test]
    fn test_empty_key_is_rejected() {
        let err = QueryKey::new().canonicalize().unwrap_err();
        assert!(matches!(err, QueryError::InvalidKey(_)));
    }

    #[test]
    fn test_non_finite_number_is_rejected() {
        let key = query_key!["posts", f64::NAN];
        assert!(matches!(key.canonicalize(), Err(QueryError::InvalidKey(_))));

        let key = query_key!["posts", KeySegment::map([("score", f64::INFINITY)])];
        assert!(matches!(key.validate(), Err(QueryError::InvalidKey(_))));
    }

    #[test]
    fn test_prefix_matching() {
        let posts = query_key!["posts"];
        assert!(matches(&posts, &query_key!["posts"], false));
        assert!(matches(&posts, &query_key!["posts", 1], false));
        assert!(!matches(&posts, &query_key!["users"], false));
        assert!(!matches(&query_key!["posts", 1], &posts, false));
    }

    #[test]
    fn test_exact_matching() {
        let posts = query_key!["posts"];
        assert!(matches(&posts, &query_key!["posts"], true));
        assert!(!matches(&posts, &query_key!["posts", 1], true));
    }

    #[test]
    fn test_negative_zero() {
        let zero = query_key!["posts", 0.0];
        let negative = query_key!["posts", -0.0];
        assert_eq!(zero.canonicalize().unwrap(), r#"["posts",0.0]"#);
        assert_eq!(negative.canonicalize().unwrap(), r#"["posts",0.0]"#);

        // Built without `From`, the sign survives and gives a distinct identity.
        let signed = QueryKey::from(vec![KeySegment::from("posts"), KeySegment::Float(-0.0)]);
        assert_ne!(signed.canonicalize().unwrap(), zero.canonicalize().unwrap());
        assert!(!matches(&zero, &signed, true));
        assert!(!matches(&zero, &signed, false));

        let mapped = query_key!["posts", KeySegment::map([("score", -0.0)])];
        assert_eq!(mapped.canonicalize().unwrap(), r#"["posts",{"score":0.0}]"#);
    }

    #[test]
    fn test_filters() {
        let all = QueryFilters::all();
        assert!(all.matches(&query_key!["users"]));

        let prefix = QueryFilters::prefix(query_key!["posts"]);
        assert!(prefix.matches(&query_key!["posts", 1]));
        assert!(!prefix.matches(&query_key!["users"]));

        let exact = QueryFilters::exact("posts");
        assert!(exact.matches(&query_key!["posts"]));
        assert!(!exact.matches(&query_key!["posts", 1]));
    }

    #[test]
    fn test_builder_and_display() {
        let key = QueryKey::new().with("posts").with(2).with("comments");
        assert_eq!(key.len(), 3);
        assert_eq!(key.to_string(), r#"["posts",2,"comments"]"#);
    }
}
