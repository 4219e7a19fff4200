//! Structural query keys.
//!
//! A [`QueryKey`] is an ordered sequence of primitive values identifying one
//! cached resource request, e.g. `["diagnostics-report", "svc-env-7", 3]`.
//! Equality and hashing are structural: two keys built independently from
//! the same values address the same cache entry.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One primitive segment of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Null => f.write_str("null"),
            KeyPart::Bool(b) => write!(f, "{b}"),
            KeyPart::Int(i) => write!(f, "{i}"),
            KeyPart::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<&str> for KeyPart {
    fn from(s: &str) -> Self {
        KeyPart::Str(s.to_owned())
    }
}

impl From<String> for KeyPart {
    fn from(s: String) -> Self {
        KeyPart::Str(s)
    }
}

impl From<&String> for KeyPart {
    fn from(s: &String) -> Self {
        KeyPart::Str(s.clone())
    }
}

impl From<bool> for KeyPart {
    fn from(b: bool) -> Self {
        KeyPart::Bool(b)
    }
}

impl From<i64> for KeyPart {
    fn from(i: i64) -> Self {
        KeyPart::Int(i)
    }
}

impl From<i32> for KeyPart {
    fn from(i: i32) -> Self {
        KeyPart::Int(i.into())
    }
}

impl From<u32> for KeyPart {
    fn from(i: u32) -> Self {
        KeyPart::Int(i.into())
    }
}

impl From<u64> for KeyPart {
    fn from(i: u64) -> Self {
        // Values past i64::MAX keep their identity as text.
        i64::try_from(i).map_or_else(|_| KeyPart::Str(i.to_string()), KeyPart::Int)
    }
}

impl<T: Into<KeyPart>> From<Option<T>> for KeyPart {
    fn from(value: Option<T>) -> Self {
        value.map_or(KeyPart::Null, Into::into)
    }
}

/// Structural identifier for a cached resource request.
///
/// ```rust
/// # use skuld::QueryKey;
/// let a = QueryKey::new("diagnostics-report").with("svc-env-7").with(3);
/// let b = skuld::query_key!["diagnostics-report", "svc-env-7", 3];
/// assert_eq!(a, b);
/// assert!(a.starts_with(&QueryKey::new("diagnostics-report")));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<KeyPart>);

impl QueryKey {
    /// Start a key with its resource name.
    pub fn new(resource: impl Into<KeyPart>) -> Self {
        Self(vec![resource.into()])
    }

    /// Build a key from already converted parts.
    pub fn from_parts(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }

    /// Append a parameter segment.
    pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
        self.0.push(part.into());
        self
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Resource name used as the `resource` metric label.
    ///
    /// Returns `"unknown"` when the first segment is not a string.
    pub fn resource(&self) -> &str {
        match self.0.first() {
            Some(KeyPart::Str(s)) => s,
            _ => "unknown",
        }
    }

    /// Whether `prefix` matches the leading segments of this key.
    ///
    /// An empty prefix matches every key.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{part}")?;
        }
        f.write_str("]")
    }
}

impl<P: Into<KeyPart>> FromIterator<P> for QueryKey {
    fn from_iter<I: IntoIterator<Item = P>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Build a [`QueryKey`] from a list of primitive values.
#[macro_export]
macro_rules! query_key {
    ($($part:expr),* $(,)?) => {
        $crate::QueryKey::from_parts(vec![$($crate::KeyPart::from($part)),*])
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of(key: &QueryKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn structural_equality() {
        let id = String::from("svc-1");
        let a = QueryKey::new("diagnostics-report").with(&id).with(2);
        let b = query_key!["diagnostics-report", "svc-1", 2];
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn order_matters() {
        let a = query_key!["users", 1, 2];
        let b = query_key!["users", 2, 1];
        assert_ne!(a, b);
    }

    #[test]
    fn integer_widths_normalise() {
        assert_eq!(query_key!["t", 5i32], query_key!["t", 5u64]);
    }

    #[test]
    fn none_becomes_null() {
        let team: Option<i64> = None;
        let key = query_key!["users", team];
        assert_eq!(key.parts()[1], KeyPart::Null);
    }

    #[test]
    fn prefix_matching() {
        let key = query_key!["users", 42, "profile"];
        assert!(key.starts_with(&query_key!["users"]));
        assert!(key.starts_with(&query_key!["users", 42]));
        assert!(!key.starts_with(&query_key!["users", 43]));
        assert!(key.starts_with(&QueryKey::from_parts(vec![])));
    }

    #[test]
    fn resource_label() {
        assert_eq!(query_key!["slo", 1].resource(), "slo");
        assert_eq!(query_key![1, "slo"].resource(), "unknown");
    }

    #[test]
    fn display_and_serialize() {
        let key = query_key!["teams", 7, true];
        assert_eq!(key.to_string(), r#"["teams", 7, true]"#);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, r#"["teams",7,true]"#);
        let back: QueryKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
