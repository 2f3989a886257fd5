//! Per-site participant ID allocation.
//!
//! The [`Allocator`] owns one slot per site. A slot is a mutex around the
//! site's cached [`SequenceState`]; every allocation, release and completion
//! for that site runs as a load-modify-save critical section inside it. Slots
//! for different sites are independent, so a slow disk on one site never
//! stalls another.
//!
//! The in-memory copy only advances after the store acknowledged the save. A
//! failed save therefore leaves both the durable and the cached state
//! untouched and the caller sees [`Error::Storage`].

mod policy;
#[cfg(test)]
mod tests;

pub use policy::*;

use crate::{
    Assignment, Error, Exhaustion, ParticipantId, Result, SequenceState, SequenceStore, Site,
    SystemClock, TimeSource,
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

#[derive(Default)]
struct Slot {
    cached: Option<SequenceState>,
}

/// Hands out unique, sequential participant IDs per site.
///
/// ## Guarantees
///
/// - Two concurrent callers for the same site never receive the same ID.
/// - The smallest released ID is reused before a new one is minted.
/// - An ID is durable in the [`SequenceStore`] before it is returned.
/// - Only the session holding an ID's current lease can release or
///   complete it.
///
/// # Example
///
/// ```
/// use cohort::{Allocator, AllocatorConfig, MemorySequenceStore, Site};
///
/// let allocator = Allocator::new(MemorySequenceStore::new(), AllocatorConfig::default());
/// let site = Site::new("hildesheim").unwrap();
///
/// let first = allocator.allocate(&site).unwrap();
/// let second = allocator.allocate(&site).unwrap();
/// assert_eq!((first.id.get(), second.id.get()), (1, 2));
///
/// allocator.release(&site, first).unwrap();
/// let again = allocator.allocate(&site).unwrap();
/// assert_eq!(again.id, first.id);
/// assert_ne!(again.lease, first.lease);
/// ```
pub struct Allocator<S, T = SystemClock>
where
    S: SequenceStore,
    T: TimeSource,
{
    store: S,
    clock: T,
    config: AllocatorConfig,
    slots: Mutex<HashMap<Site, Arc<Mutex<Slot>>>>,
}

impl<S> Allocator<S>
where
    S: SequenceStore,
{
    /// Creates an allocator stamping leases with the system clock.
    pub fn new(store: S, config: AllocatorConfig) -> Self {
        Self::with_clock(store, SystemClock, config)
    }
}

impl<S, T> Allocator<S, T>
where
    S: SequenceStore,
    T: TimeSource,
{
    /// Creates an allocator with an explicit [`TimeSource`].
    pub fn with_clock(store: S, clock: T, config: AllocatorConfig) -> Self {
        Self {
            store,
            clock,
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub const fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Returns the next usable ID for `site`, with the lease it is issued
    /// under.
    ///
    /// Under [`ReclaimPolicy::AfterIdle`], stale leases are returned to the
    /// pool first, so they compete with ordinary released IDs.
    ///
    /// # Errors
    ///
    /// - [`Error::Exhausted`] when every ID up to the configured cap is
    ///   assigned or consumed.
    /// - [`Error::Storage`] when the store cannot be read or written. No ID
    ///   was handed out.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(site = %site)))]
    pub fn allocate(&self, site: &Site) -> Result<Assignment> {
        let now = self.clock.current_millis();
        let cap = self.config.cap();
        let reclaim = self.config.reclaim;

        let (raw, lease) = self.transact(site, |state| {
            if let ReclaimPolicy::AfterIdle(idle) = reclaim {
                let idle_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX);
                if let Some(cutoff) = now.checked_sub(idle_ms) {
                    let _reclaimed = state.reclaim_issued_before(cutoff);
                    #[cfg(feature = "tracing")]
                    {
                        if !_reclaimed.is_empty() {
                            tracing::info!(ids = ?_reclaimed, "reclaimed idle participant ids");
                        }
                    }
                }
            }
            state.take_next(cap, now).ok_or_else(|| {
                Error::Exhausted(Exhaustion::Ids {
                    site: site.to_string(),
                    cap,
                })
            })
        })?;

        #[cfg(feature = "tracing")]
        tracing::debug!(id = raw, lease = lease.serial, "allocated participant id");
        Ok(Assignment {
            id: ParticipantId::new(raw)?,
            lease: lease.serial,
        })
    }

    /// Returns an assigned ID to the site's free pool.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] unless `assignment` is the live lease on its
    ///   ID (never minted, already released, consumed, or reclaimed and
    ///   reissued since).
    /// - [`Error::Storage`] when the store cannot be written.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(site = %site, assignment = %assignment)))]
    pub fn release(&self, site: &Site, assignment: Assignment) -> Result<()> {
        let id = assignment.id;
        self.transact(site, |state| {
            if !state.end_lease(id.get(), assignment.lease) {
                return Err(Error::validation(format!(
                    "participant {id} is not assigned under lease {} at site `{site}`",
                    assignment.lease
                )));
            }
            state.released.insert(id.get());
            Ok(())
        })
    }

    /// Marks an assigned ID as consumed by a submission. Completing an ID
    /// that is already consumed is a no-op, so duplicate submissions are
    /// harmless.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if the ID was never minted, sits in the free
    ///   pool, or is currently leased to a different session.
    /// - [`Error::Storage`] when the store cannot be written.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(site = %site, assignment = %assignment)))]
    pub fn complete(&self, site: &Site, assignment: Assignment) -> Result<()> {
        let id = assignment.id;
        self.transact(site, |state| {
            if state.end_lease(id.get(), assignment.lease) || state.is_consumed(id.get()) {
                Ok(())
            } else {
                Err(Error::validation(format!(
                    "participant {id} is not assigned under lease {} at site `{site}`",
                    assignment.lease
                )))
            }
        })
    }

    /// Current allocation state of `site`.
    pub fn snapshot(&self, site: &Site) -> Result<SequenceState> {
        self.transact(site, |state| Ok(state.clone()))
    }

    fn slot(&self, site: &Site) -> Arc<Mutex<Slot>> {
        Arc::clone(self.slots.lock().entry(site.clone()).or_default())
    }

    /// Runs `f` on a copy of the site's state inside the site's critical
    /// section and persists the copy if `f` changed it.
    ///
    /// Sites that have never allocated do not keep a slot afterwards, so
    /// lookups for arbitrary tokens leave nothing behind.
    fn transact<R>(
        &self,
        site: &Site,
        f: impl FnOnce(&mut SequenceState) -> Result<R>,
    ) -> Result<R> {
        let slot = self.slot(site);
        let (out, untouched) = {
            let mut guard = slot.lock();
            let out = Self::apply(&self.store, site, &mut guard, f);
            let untouched = guard.cached.as_ref().is_none_or(|s| s.high_water == 0);
            (out, untouched)
        };
        if untouched {
            self.evict_if_idle(site, &slot);
        }
        out
    }

    fn apply<R>(
        store: &S,
        site: &Site,
        slot: &mut Slot,
        f: impl FnOnce(&mut SequenceState) -> Result<R>,
    ) -> Result<R> {
        if slot.cached.is_none() {
            slot.cached = Some(store.load(site)?.unwrap_or_default());
        }
        let current = slot.cached.get_or_insert_with(SequenceState::default);

        let mut next = current.clone();
        let out = f(&mut next)?;
        if next != *current {
            store.save(site, &next)?;
            *current = next;
        }
        Ok(out)
    }

    /// Drops the slot of a site with no persisted state, unless another
    /// caller holds it. New handles are only cloned under the map lock, so
    /// the count cannot grow while it is checked.
    fn evict_if_idle(&self, site: &Site, slot: &Arc<Mutex<Slot>>) {
        let mut slots = self.slots.lock();
        if Arc::strong_count(slot) == 2 {
            slots.remove(site);
        }
    }
}
