//! Name/value pairs carried next to the trace identifiers across process
//! boundaries.
//!
//! [`Baggage`] keeps its entries in insertion order so that a header produced
//! from it is deterministic. When the same name appears more than once while
//! baggage is *built* from a list of entries, or parsed from a carrier, the
//! **first** value wins and later duplicates are dropped. The same rule is
//! applied on inject and extract, so a round trip through a single-valued
//! carrier never changes which value is observed.
//!
//! See the [W3C Baggage] specification.
//!
//! [W3C Baggage]: https://w3c.github.io/baggage
use crate::{Key, KeyValue};
use indexmap::map::{self, Entry};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use std::fmt;

static DEFAULT_BAGGAGE: Lazy<Baggage> = Lazy::new(Baggage::default);

pub(crate) const MAX_KEY_VALUE_PAIRS: usize = 180;
pub(crate) const MAX_LEN_OF_ALL_PAIRS: usize = 4096;

// https://datatracker.ietf.org/doc/html/rfc7230#section-3.2.6
const INVALID_ASCII_KEY_CHARS: [u8; 17] = [
    b'(', b')', b',', b'/', b':', b';', b'<', b'=', b'>', b'?', b'@', b'[', b'\\', b']', b'{',
    b'}', b'"',
];

pub(crate) fn empty() -> &'static Baggage {
    &DEFAULT_BAGGAGE
}

/// An ordered set of name/value pairs describing user-defined properties.
///
/// ### Limits
///
/// * Maximum number of name/value pairs: `180`.
/// * Maximum total length of all name/value pairs: `4096`.
///
/// Inserts that would exceed a limit are rejected.
///
/// <https://www.w3.org/TR/baggage/#limits>
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Baggage {
    inner: IndexMap<Key, (String, BaggageMetadata)>,
    kv_content_len: usize,
}

impl Baggage {
    /// Creates an empty `Baggage`.
    pub fn new() -> Self {
        Baggage::default()
    }

    /// Returns the value associated with a given name
    ///
    /// ```
    /// use opentelemetry_instrumentation::baggage::Baggage;
    ///
    /// let baggage: Baggage = [("user", "alice"), ("user", "bob")].into_iter().collect();
    ///
    /// assert_eq!(baggage.get("user"), Some("alice"));
    /// ```
    pub fn get<K: AsRef<str>>(&self, key: K) -> Option<&str> {
        self.inner
            .get(key.as_ref())
            .map(|(value, _metadata)| value.as_str())
    }

    /// Returns the value and metadata associated with a given name
    pub fn get_with_metadata<K: AsRef<str>>(&self, key: K) -> Option<&(String, BaggageMetadata)> {
        self.inner.get(key.as_ref())
    }

    /// Inserts a name/value pair, replacing any previous value for the name.
    ///
    /// Returns the previous value, if any. Invalid names and inserts that would
    /// exceed the limits are ignored and return `None`.
    pub fn insert<K, V>(&mut self, key: K, value: V) -> Option<String>
    where
        K: Into<Key>,
        V: Into<String>,
    {
        self.insert_with_metadata(key, value, BaggageMetadata::default())
            .map(|pair| pair.0)
    }

    /// Inserts a name/value pair with metadata, replacing any previous entry.
    pub fn insert_with_metadata<K, V, S>(
        &mut self,
        key: K,
        value: V,
        metadata: S,
    ) -> Option<(String, BaggageMetadata)>
    where
        K: Into<Key>,
        V: Into<String>,
        S: Into<BaggageMetadata>,
    {
        let (key, value, metadata) = (key.into(), value.into(), metadata.into());
        let entries_count = self.inner.len();
        match self.inner.entry(key) {
            Entry::Occupied(mut occupied_entry) => {
                let key_str = occupied_entry.key().as_str();
                let entry_content_len =
                    key_value_metadata_bytes_size(key_str, &value, metadata.as_str());
                let prev_content_len = key_value_metadata_bytes_size(
                    key_str,
                    &occupied_entry.get().0,
                    occupied_entry.get().1.as_str(),
                );
                let new_content_len = self.kv_content_len + entry_content_len - prev_content_len;
                if new_content_len > MAX_LEN_OF_ALL_PAIRS {
                    return None;
                }
                self.kv_content_len = new_content_len;
                Some(occupied_entry.insert((value, metadata)))
            }
            Entry::Vacant(vacant_entry) => {
                let key_str = vacant_entry.key().as_str();
                if !Self::is_key_valid(key_str.as_bytes()) || entries_count == MAX_KEY_VALUE_PAIRS {
                    return None;
                }
                let entry_content_len =
                    key_value_metadata_bytes_size(key_str, &value, metadata.as_str());
                let new_content_len = self.kv_content_len + entry_content_len;
                if new_content_len > MAX_LEN_OF_ALL_PAIRS {
                    return None;
                }
                self.kv_content_len = new_content_len;
                vacant_entry.insert((value, metadata));
                None
            }
        }
    }

    /// Inserts the pair only when the name is not present yet.
    ///
    /// Returns `true` if the pair was stored.
    pub fn insert_if_absent<K, V, S>(&mut self, key: K, value: V, metadata: S) -> bool
    where
        K: Into<Key>,
        V: Into<String>,
        S: Into<BaggageMetadata>,
    {
        let key = key.into();
        if self.inner.contains_key(key.as_str()) {
            return false;
        }
        let before = self.inner.len();
        self.insert_with_metadata(key, value, metadata);
        self.inner.len() > before
    }

    /// Removes a name from the baggage, returning its value and metadata.
    pub fn remove<K: AsRef<str>>(&mut self, key: K) -> Option<(String, BaggageMetadata)> {
        let removed = self.inner.shift_remove(key.as_ref());
        if let Some((value, metadata)) = &removed {
            self.kv_content_len -=
                key_value_metadata_bytes_size(key.as_ref(), value, metadata.as_str());
        }
        removed
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the baggage contains no items.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Gets an iterator over the baggage items, in insertion order.
    pub fn iter(&self) -> Iter<'_> {
        self.into_iter()
    }

    fn is_key_valid(key: &[u8]) -> bool {
        !key.is_empty()
            && key
                .iter()
                .all(|b| b.is_ascii_graphic() && !INVALID_ASCII_KEY_CHARS.contains(b))
    }
}

fn key_value_metadata_bytes_size(key: &str, value: &str, metadata: &str) -> usize {
    key.len() + value.len() + metadata.len()
}

/// An iterator over the entries of a [`Baggage`].
#[derive(Debug)]
pub struct Iter<'a>(map::Iter<'a, Key, (String, BaggageMetadata)>);

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a Key, &'a (String, BaggageMetadata));

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

impl<'a> IntoIterator for &'a Baggage {
    type Item = (&'a Key, &'a (String, BaggageMetadata));
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        Iter(self.inner.iter())
    }
}

impl FromIterator<KeyValueMetadata> for Baggage {
    fn from_iter<I: IntoIterator<Item = KeyValueMetadata>>(iter: I) -> Self {
        let mut baggage = Baggage::default();
        for kvm in iter {
            baggage.insert_if_absent(kvm.key, kvm.value, kvm.metadata);
        }
        baggage
    }
}

impl FromIterator<KeyValue> for Baggage {
    fn from_iter<I: IntoIterator<Item = KeyValue>>(iter: I) -> Self {
        iter.into_iter().map(KeyValueMetadata::from).collect()
    }
}

impl<K, V> FromIterator<(K, V)> for Baggage
where
    K: Into<Key>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .map(|(key, value)| KeyValueMetadata::new(key, value, ""))
            .collect()
    }
}

impl<I> From<I> for Baggage
where
    I: IntoIterator,
    I::Item: Into<KeyValueMetadata>,
{
    fn from(value: I) -> Self {
        value.into_iter().map(Into::into).collect()
    }
}

impl fmt::Display for Baggage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.inner.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", k, v.0)?;
            if !v.1.as_str().is_empty() {
                write!(f, ";{}", v.1)?;
            }
        }
        Ok(())
    }
}

/// An optional property set of a baggage entry, e.g. `k1=v1;k2`.
#[derive(Clone, Debug, PartialOrd, PartialEq, Eq, Default)]
pub struct BaggageMetadata(String);

impl BaggageMetadata {
    /// Returns the metadata as a string slice
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<String> for BaggageMetadata {
    fn from(s: String) -> BaggageMetadata {
        BaggageMetadata(s.trim().to_string())
    }
}

impl From<&str> for BaggageMetadata {
    fn from(s: &str) -> Self {
        BaggageMetadata(s.trim().to_string())
    }
}

impl fmt::Display for BaggageMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A [`Baggage`] entry: name, value and metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyValueMetadata {
    /// Dimension or event key
    pub key: Key,
    /// Dimension or event value
    pub value: String,
    /// Metadata associated with this pair
    pub metadata: BaggageMetadata,
}

impl KeyValueMetadata {
    /// Create a new entry
    pub fn new<K, V, S>(key: K, value: V, metadata: S) -> Self
    where
        K: Into<Key>,
        V: Into<String>,
        S: Into<BaggageMetadata>,
    {
        KeyValueMetadata {
            key: key.into(),
            value: value.into(),
            metadata: metadata.into(),
        }
    }
}

impl From<KeyValue> for KeyValueMetadata {
    fn from(kv: KeyValue) -> Self {
        KeyValueMetadata {
            key: kv.key,
            value: kv.value.as_str().into_owned(),
            metadata: BaggageMetadata::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn building_keeps_first_value() {
        let baggage: Baggage = [("a", "1"), ("b", "2"), ("a", "3")].into_iter().collect();
        assert_eq!(baggage.len(), 2);
        assert_eq!(baggage.get("a"), Some("1"));
        let keys: Vec<&str> = baggage.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn insert_replaces() {
        let mut baggage = Baggage::new();
        assert_eq!(baggage.insert("a", "1"), None);
        assert_eq!(baggage.insert("a", "2"), Some("1".to_string()));
        assert_eq!(baggage.get("a"), Some("2"));
    }

    #[test]
    fn rejects_invalid_keys() {
        let mut baggage = Baggage::new();
        baggage.insert("bad key", "1");
        baggage.insert("bad;key", "1");
        baggage.insert("", "1");
        assert!(baggage.is_empty());
    }

    #[test]
    fn enforces_entry_limit() {
        let baggage: Baggage = (0..MAX_KEY_VALUE_PAIRS + 10)
            .map(|i| (format!("k{}", i), "v"))
            .collect();
        assert_eq!(baggage.len(), MAX_KEY_VALUE_PAIRS);
    }

    #[test]
    fn enforces_length_limit() {
        let mut baggage = Baggage::new();
        baggage.insert("big", "x".repeat(MAX_LEN_OF_ALL_PAIRS));
        assert!(baggage.is_empty());
        baggage.insert("small", "x");
        assert_eq!(baggage.len(), 1);
        assert!(baggage.remove("small").is_some());
        baggage.insert("big", "x".repeat(MAX_LEN_OF_ALL_PAIRS - 3));
        assert_eq!(baggage.len(), 1);
    }

    #[test]
    fn display_in_insertion_order() {
        let mut baggage = Baggage::new();
        baggage.insert_with_metadata("z", "1", "ttl=10");
        baggage.insert("a", "2");
        assert_eq!(baggage.to_string(), "z=1;ttl=10,a=2");
    }
}
