//! Stream entries and their field lists

use serde::{Deserialize, Serialize};

use crate::error::{StreamError, StreamResult};
use crate::id::StreamId;

/// Ordered list of `name -> value` pairs
///
/// Insertion order is preserved and duplicate names are kept as given;
/// [`Fields::get`] returns the first match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fields(Vec<(String, String)>);

impl Fields {
    /// Create an empty field list
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name, value);
        self
    }

    /// Append a field in place
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Value of the first field with this name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no fields
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(name, value)` pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Check the list is acceptable for an append
    pub fn validate(&self) -> StreamResult<()> {
        if self.0.is_empty() {
            return Err(StreamError::InvalidEntry(
                "an entry needs at least one field".to_string(),
            ));
        }
        if let Some(pos) = self.0.iter().position(|(n, _)| n.is_empty()) {
            return Err(StreamError::InvalidEntry(format!(
                "field {} has an empty name",
                pos
            )));
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Fields {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl IntoIterator for Fields {
    type Item = (String, String);
    type IntoIter = std::vec::IntoIter<(String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// One immutable record of a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Entry identifier
    pub id: StreamId,
    /// Field list as appended
    pub fields: Fields,
}

impl Entry {
    /// Create a new entry
    pub fn new(id: StreamId, fields: Fields) -> Self {
        Self { id, fields }
    }
}
