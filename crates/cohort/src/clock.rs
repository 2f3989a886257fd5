use std::time::{SystemTime, UNIX_EPOCH};

/// A source of wall-clock timestamps used to stamp ID leases.
///
/// Lease ages only decide when an abandoned ID may be reclaimed, so
/// millisecond resolution against the UNIX epoch is plenty. Tests plug in a
/// fixed or stepped clock instead of sleeping.
///
/// # Example
///
/// ```
/// use cohort::TimeSource;
///
/// struct FixedTime;
/// impl TimeSource for FixedTime {
///     fn current_millis(&self) -> u64 {
///         1234
///     }
/// }
///
/// assert_eq!(FixedTime.current_millis(), 1234);
/// ```
pub trait TimeSource {
    /// Milliseconds since the UNIX epoch.
    fn current_millis(&self) -> u64;
}

/// [`TimeSource`] backed by [`SystemTime::now`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn current_millis(&self) -> u64 {
        // A clock set before 1970 reads as the epoch; leases then never age,
        // which only delays reclaim.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

impl<T: TimeSource + ?Sized> TimeSource for std::sync::Arc<T> {
    fn current_millis(&self) -> u64 {
        (**self).current_millis()
    }
}
