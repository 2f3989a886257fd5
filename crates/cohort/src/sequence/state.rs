use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Persisted allocation state of one site.
///
/// Invariants:
/// - every ID in `released` and every key of `leases` is in
///   `1..=high_water`;
/// - `released` and `leases` are disjoint;
/// - every lease serial is at most `lease_seq`, and no two leases share one.
///
/// IDs in `1..=high_water` that appear in neither collection have been
/// consumed by a submission.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceState {
    /// Largest ID ever minted for the site; `0` before the first allocation.
    pub high_water: u64,
    /// IDs handed back to the pool, reused smallest first.
    #[serde(default)]
    pub released: BTreeSet<u64>,
    /// Outstanding IDs and the lease each was issued under.
    #[serde(default)]
    pub leases: BTreeMap<u64, Lease>,
    /// Serial of the most recently issued lease.
    #[serde(default)]
    pub lease_seq: u64,
}

/// One issue of an ID to a session.
///
/// The serial changes every time an ID is handed out, so a session whose ID
/// was reclaimed and reissued can no longer act on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// UNIX millis at issue time.
    pub issued_at: u64,
    pub serial: u64,
}

impl SequenceState {
    /// Picks the next ID under `cap` and records a fresh lease for it.
    ///
    /// The smallest released ID wins; otherwise the high-water mark is
    /// advanced. Returns `None` when neither is possible.
    pub(crate) fn take_next(&mut self, cap: u64, now: u64) -> Option<(u64, Lease)> {
        let id = match self.released.first().copied() {
            Some(id) if id <= cap => {
                self.released.remove(&id);
                id
            }
            _ if self.high_water < cap => {
                self.high_water += 1;
                self.high_water
            }
            _ => return None,
        };
        self.lease_seq += 1;
        let lease = Lease {
            issued_at: now,
            serial: self.lease_seq,
        };
        self.leases.insert(id, lease);
        Some((id, lease))
    }

    /// Moves every lease issued at or before `cutoff` into the free pool and
    /// returns the reclaimed IDs in ascending order.
    pub(crate) fn reclaim_issued_before(&mut self, cutoff: u64) -> Vec<u64> {
        let stale: Vec<u64> = self
            .leases
            .iter()
            .filter(|&(_, lease)| lease.issued_at <= cutoff)
            .map(|(&id, _)| id)
            .collect();
        for id in &stale {
            self.leases.remove(id);
            self.released.insert(*id);
        }
        stale
    }

    /// Removes the lease on `id` if it carries `serial`.
    pub(crate) fn end_lease(&mut self, id: u64, serial: u64) -> bool {
        if self.leases.get(&id).is_some_and(|l| l.serial == serial) {
            self.leases.remove(&id);
            true
        } else {
            false
        }
    }

    /// Whether `id` was minted and has since been consumed.
    pub(crate) fn is_consumed(&self, id: u64) -> bool {
        id >= 1
            && id <= self.high_water
            && !self.leases.contains_key(&id)
            && !self.released.contains(&id)
    }

    /// Number of IDs currently held by sessions.
    pub fn outstanding(&self) -> usize {
        self.leases.len()
    }
}
