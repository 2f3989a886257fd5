use core::time::Duration;

/// What happens to IDs whose sessions never submit and are never released.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReclaimPolicy {
    /// Abandoned IDs stay assigned forever. Only an explicit
    /// [`Allocator::release`](crate::Allocator::release) returns them.
    #[default]
    Never,
    /// A lease older than this is returned to the free pool the next time
    /// the site allocates.
    AfterIdle(Duration),
}

impl ReclaimPolicy {
    /// `None` and zero both mean [`ReclaimPolicy::Never`].
    pub fn from_secs(secs: Option<u64>) -> Self {
        match secs {
            Some(secs) if secs > 0 => Self::AfterIdle(Duration::from_secs(secs)),
            _ => Self::Never,
        }
    }
}

/// Construction-time settings for an [`Allocator`](crate::Allocator).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Highest ID a site may hand out. `None` leaves allocation unbounded.
    ///
    /// Usually the stimulus capacity, so that every issued ID has a full
    /// slice.
    pub max_participants: Option<u64>,
    pub reclaim: ReclaimPolicy,
}

impl AllocatorConfig {
    pub(crate) fn cap(&self) -> u64 {
        self.max_participants.unwrap_or(u64::MAX)
    }
}
