//! Deterministic stimulus partitioning.
//!
//! Participant `id` owns the half-open range
//! `[(id - 1) * items_per_participant, id * items_per_participant)` of the
//! stimulus list. Ranges of distinct IDs never overlap, and the same ID always
//! reproduces the same items. A range that would run past the end of the list
//! is reported as [`Exhaustion::Stimuli`]; it is never truncated.

mod list;

pub use list::*;

use crate::{Error, Exhaustion, Result};

/// Returns the items assigned to participant `id`.
///
/// # Errors
///
/// - [`Error::Validation`] if `id` is `0` or `items_per_participant` is `0`.
/// - [`Error::Exhausted`] if `id * items_per_participant > items.len()`.
///
/// # Example
///
/// ```
/// let words = ["Haus", "Baum", "Tisch", "Stuhl", "Lampe"];
/// assert_eq!(cohort::slice(2, &words, 2).unwrap(), &["Tisch", "Stuhl"]);
/// assert!(cohort::slice(3, &words, 2).is_err());
/// ```
pub fn slice<T>(id: u64, items: &[T], items_per_participant: usize) -> Result<&[T]> {
    if id == 0 {
        return Err(Error::validation("participant id must be >= 1"));
    }
    if items_per_participant == 0 {
        return Err(Error::validation("items_per_participant must be >= 1"));
    }

    let end = u64::try_from(items_per_participant)
        .ok()
        .and_then(|per| id.checked_mul(per))
        .and_then(|end| usize::try_from(end).ok());

    match end {
        Some(end) if end <= items.len() => Ok(&items[end - items_per_participant..end]),
        _ => Err(Error::Exhausted(Exhaustion::Stimuli {
            id,
            needed: end.unwrap_or(usize::MAX),
            available: items.len(),
        })),
    }
}

/// Number of participants a list of `len` items can serve in full.
pub const fn capacity(len: usize, items_per_participant: usize) -> u64 {
    if items_per_participant == 0 {
        return 0;
    }
    (len / items_per_participant) as u64
}
