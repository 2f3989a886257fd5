use crate::{Error, ParticipantId, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{collections::HashSet, fs, path::Path};

/// The ordered, read-only stimulus set of a deployment.
///
/// Loaded once at startup and shared by every request. Items are opaque to
/// this crate; the default item type keeps whatever JSON the experiment
/// front-end expects.
#[derive(Clone, Debug, PartialEq)]
pub struct StimulusList<T = Value> {
    items: Vec<T>,
}

impl<T> StimulusList<T> {
    pub const fn new(items: Vec<T>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// How many participants get a full slice of `items_per_participant`.
    pub fn capacity(&self, items_per_participant: usize) -> u64 {
        super::capacity(self.items.len(), items_per_participant)
    }

    /// The slice owned by `id`. See [`slice`](crate::slice).
    pub fn slice_for(&self, id: ParticipantId, items_per_participant: usize) -> Result<&[T]> {
        super::slice(id.get(), &self.items, items_per_participant)
    }
}

impl<T: DeserializeOwned> StimulusList<T> {
    /// Reads a JSON array of items from `path`.
    ///
    /// # Errors
    ///
    /// - [`Error::Storage`] if the file cannot be read.
    /// - [`Error::Validation`] if it is not a JSON array of `T`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).map_err(|e| Error::storage(format!("read {}", path.display()), e))?;
        let items: Vec<T> = serde_json::from_slice(&bytes).map_err(|e| {
            Error::validation(format!(
                "{} is not a JSON array of stimuli: {e}",
                path.display()
            ))
        })?;
        Ok(Self { items })
    }
}

impl StimulusList<Value> {
    /// Items of `practice` whose string `field` value also occurs in this
    /// list, in practice order.
    ///
    /// Practice trials are meant to use words that never appear in the real
    /// trials; a non-empty result means a participant would see a word twice.
    pub fn overlap_by_field<'a>(&self, practice: &'a Self, field: &str) -> Vec<&'a Value> {
        let seen: HashSet<&str> = self
            .items
            .iter()
            .filter_map(|item| item.get(field)?.as_str())
            .collect();
        practice
            .items
            .iter()
            .filter(|item| {
                item.get(field)
                    .and_then(Value::as_str)
                    .is_some_and(|v| seen.contains(v))
            })
            .collect()
    }
}

impl<T> From<Vec<T>> for StimulusList<T> {
    fn from(items: Vec<T>) -> Self {
        Self::new(items)
    }
}
