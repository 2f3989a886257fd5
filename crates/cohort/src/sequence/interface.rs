use crate::{Result, SequenceState, Site};

/// Durable home of each site's allocation counter.
///
/// A store only persists and returns whole [`SequenceState`] snapshots; it
/// does no arbitration of its own. The [`Allocator`] serializes every
/// read-modify-write per site, so a store sees at most one writer per site at
/// a time.
///
/// [`Allocator`]: crate::Allocator
pub trait SequenceStore {
    /// Returns the last saved state for `site`, or `None` for a site that has
    /// never allocated.
    fn load(&self, site: &Site) -> Result<Option<SequenceState>>;

    /// Durably replaces the state for `site`. When this returns `Ok` the new
    /// state must survive a crash.
    fn save(&self, site: &Site, state: &SequenceState) -> Result<()>;
}

impl<S: SequenceStore + ?Sized> SequenceStore for std::sync::Arc<S> {
    fn load(&self, site: &Site) -> Result<Option<SequenceState>> {
        (**self).load(site)
    }

    fn save(&self, site: &Site, state: &SequenceState) -> Result<()> {
        (**self).save(site, state)
    }
}
