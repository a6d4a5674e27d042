//! Immutable typed key/value sets attached to spans, metrics and contexts.

use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;

/// The value part of a tag. Only strings, 64-bit integers and booleans can
/// travel on spans, metric instruments and propagated contexts.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TagValue {
    /// String values.
    String(String),
    /// Signed 64-bit integer values.
    Long(i64),
    /// Boolean values.
    Boolean(bool),
}

impl TagValue {
    /// Returns the contained string, if this is a string tag.
    pub fn as_string(&self) -> Option<&str> {
        match self {
            TagValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the contained integer, if this is a long tag.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            TagValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the contained boolean, if this is a boolean tag.
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            TagValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::String(v) => f.write_str(v),
            TagValue::Long(v) => v.fmt(f),
            TagValue::Boolean(v) => v.fmt(f),
        }
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::String(value.to_owned())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::String(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::Long(value)
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::Boolean(value)
    }
}

static EMPTY_TAG_SET: Lazy<TagSet> = Lazy::new(|| TagSet {
    entries: Arc::from(Vec::new()),
});

/// An immutable, unordered mapping from tag keys to [`TagValue`]s.
///
/// Two tag sets compare equal when they hold the same entries, regardless of
/// the order they were added in. Cloning is cheap.
///
/// The backing representation is a key-sorted slice; this keeps equality and
/// hashing element-wise and lookups binary-searched.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TagSet {
    entries: Arc<[(String, TagValue)]>,
}

impl TagSet {
    /// The tag set with no entries.
    pub fn empty() -> TagSet {
        EMPTY_TAG_SET.clone()
    }

    /// A tag set with a single entry.
    pub fn of(key: impl Into<String>, value: impl Into<TagValue>) -> TagSet {
        TagSet::builder().add(key, value).build()
    }

    /// Starts assembling a new tag set.
    pub fn builder() -> TagSetBuilder {
        TagSetBuilder::default()
    }

    /// Builds a tag set from any iterator of key/value pairs. Later values
    /// overwrite earlier ones with the same key.
    pub fn from_pairs<K, V, I>(pairs: I) -> TagSet
    where
        K: Into<String>,
        V: Into<TagValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut builder = TagSet::builder();
        for (key, value) in pairs {
            builder.put(key, value);
        }
        builder.build()
    }

    /// Looks up a tag by key.
    pub fn get(&self, key: &str) -> Option<&TagValue> {
        self.entries
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .ok()
            .map(|idx| &self.entries[idx].1)
    }

    /// Looks up a string tag, ignoring entries of other types.
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(TagValue::as_string)
    }

    /// Looks up a long tag, ignoring entries of other types.
    pub fn get_long(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(TagValue::as_long)
    }

    /// Looks up a boolean tag, ignoring entries of other types.
    pub fn get_boolean(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(TagValue::as_boolean)
    }

    /// Iterates over all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TagValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether this tag set holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns a new tag set with the entry added, overwriting any existing
    /// entry under the same key.
    pub fn with(&self, key: impl Into<String>, value: impl Into<TagValue>) -> TagSet {
        let mut builder = self.to_builder();
        builder.put(key, value);
        builder.build()
    }

    /// Returns a new tag set holding the union of `self` and `other`, with
    /// `other`'s entries winning on key collisions.
    pub fn merge(&self, other: &TagSet) -> TagSet {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        let mut builder = self.to_builder();
        for (key, value) in other.iter() {
            builder.put(key, value.clone());
        }
        builder.build()
    }

    /// Copies this tag set into a builder for further additions.
    pub fn to_builder(&self) -> TagSetBuilder {
        TagSetBuilder {
            entries: self.entries.to_vec(),
        }
    }
}

impl Default for TagSet {
    fn default() -> Self {
        TagSet::empty()
    }
}

impl fmt::Debug for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, v)| (k, v)))
            .finish()
    }
}

/// Accumulates entries for a [`TagSet`]. Adding an existing key overwrites
/// the previous value.
#[derive(Debug, Default, Clone)]
pub struct TagSetBuilder {
    entries: Vec<(String, TagValue)>,
}

impl TagSetBuilder {
    /// Adds an entry, consuming and returning the builder.
    pub fn add(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.put(key, value);
        self
    }

    /// Adds an entry in place.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<TagValue>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
        self
    }

    /// Whether nothing was added yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Produces the immutable tag set.
    pub fn build(mut self) -> TagSet {
        if self.entries.is_empty() {
            return TagSet::empty();
        }
        self.entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        TagSet {
            entries: Arc::from(self.entries),
        }
    }
}
