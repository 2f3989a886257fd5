use crate::{Error, Result};
use core::{fmt, num::NonZeroU64};
use serde::{Deserialize, Serialize};

/// A participant identifier: a positive integer, unique within a site among
/// the IDs that are currently assigned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(NonZeroU64);

impl ParticipantId {
    /// The first ID minted for a fresh site.
    pub const FIRST: Self = Self(NonZeroU64::MIN);

    /// Wraps a raw value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for `0`.
    pub fn new(raw: u64) -> Result<Self> {
        NonZeroU64::new(raw)
            .map(Self)
            .ok_or_else(|| Error::validation("participant id must be >= 1"))
    }

    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u64> for ParticipantId {
    type Error = Error;

    fn try_from(raw: u64) -> Result<Self> {
        Self::new(raw)
    }
}

impl From<ParticipantId> for u64 {
    fn from(id: ParticipantId) -> Self {
        id.get()
    }
}

/// A participant ID together with the serial of the lease it was issued
/// under.
///
/// Releasing or completing an ID requires the whole assignment, so a session
/// whose ID was reclaimed and handed to someone else is turned away instead
/// of ending the new holder's lease.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Assignment {
    pub id: ParticipantId,
    pub lease: u64,
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (lease {})", self.id, self.lease)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_rejected() {
        assert!(matches!(ParticipantId::new(0), Err(Error::Validation { .. })));
        assert_eq!(ParticipantId::new(7).unwrap().get(), 7);
        assert_eq!(ParticipantId::FIRST.get(), 1);
    }

    #[test]
    fn zero_does_not_deserialize() {
        assert!(serde_json::from_str::<ParticipantId>("0").is_err());
        assert_eq!(
            serde_json::from_str::<ParticipantId>("3").unwrap(),
            ParticipantId::new(3).unwrap()
        );
    }
}
