//! Error taxonomy shared by every `cohort` component.
//!
//! Each variant answers one question for the caller: should this request be
//! retried, or should the participant be told to stop?
//!
//! - [`Error::Storage`]: the durable store is unreachable or corrupt. Retry.
//! - [`Error::Write`]: a payload could not be durably written. Retry the whole
//!   submission.
//! - [`Error::Exhausted`]: no further IDs or stimuli exist. Stop and render
//!   "study complete".
//! - [`Error::Validation`]: the request itself is malformed. Stop; nothing was
//!   changed.

use core::fmt;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// All errors `cohort` can produce.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The sequence or log store could not be read or written.
    #[error("storage error: {context}")]
    Storage { context: String },

    /// Nothing is left to hand out for this request.
    #[error("exhausted: {0}")]
    Exhausted(Exhaustion),

    /// The request was malformed and was rejected before any side effect.
    #[error("invalid request: {reason}")]
    Validation { reason: String },

    /// A submission payload could not be durably published.
    #[error("write error: {context}")]
    Write { context: String },
}

/// What ran out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Exhaustion {
    /// Every participant ID under the site's cap is currently assigned.
    Ids { site: String, cap: u64 },
    /// The stimulus list is too short to give `id` a full slice.
    Stimuli {
        id: u64,
        needed: usize,
        available: usize,
    },
}

impl fmt::Display for Exhaustion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ids { site, cap } => {
                write!(f, "all {cap} participant IDs for site `{site}` are assigned")
            }
            Self::Stimuli {
                id,
                needed,
                available,
            } => write!(
                f,
                "participant {id} needs stimuli up to index {needed} but only {available} exist"
            ),
        }
    }
}

impl Error {
    /// Whether the same request may succeed if sent again later.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::Write { .. })
    }

    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub(crate) fn storage(context: impl fmt::Display, err: impl fmt::Display) -> Self {
        Self::Storage {
            context: format!("{context}: {err}"),
        }
    }

    pub(crate) fn write(context: impl fmt::Display, err: impl fmt::Display) -> Self {
        Self::Write {
            context: format!("{context}: {err}"),
        }
    }
}
