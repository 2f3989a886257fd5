use crate::{
    Allocator, AllocatorConfig, Assignment, Error, Exhaustion, FileSequenceStore,
    MemorySequenceStore, ParticipantId, ReclaimPolicy, Result, RetryPolicy, SequenceState,
    SequenceStore, Site, TimeSource,
};
use core::time::Duration;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::scope;

struct MockTime {
    millis: AtomicU64,
}

impl MockTime {
    fn at(millis: u64) -> Arc<Self> {
        Arc::new(Self {
            millis: AtomicU64::new(millis),
        })
    }

    fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl TimeSource for MockTime {
    fn current_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

fn site(token: &str) -> Site {
    Site::new(token).unwrap()
}

fn pid(raw: u64) -> ParticipantId {
    ParticipantId::new(raw).unwrap()
}

fn memory_allocator(config: AllocatorConfig) -> Allocator<MemorySequenceStore> {
    Allocator::new(MemorySequenceStore::new(), config)
}

fn next_id<S: SequenceStore, T: TimeSource>(allocator: &Allocator<S, T>, site: &Site) -> u64 {
    allocator.allocate(site).unwrap().id.get()
}

#[test]
fn concurrent_allocations_yield_exactly_one_through_n() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 64;
    const TOTAL: usize = THREADS * PER_THREAD;

    let allocator = memory_allocator(AllocatorConfig::default());
    let hildesheim = site("hildesheim");
    let seen = Mutex::new(Vec::with_capacity(TOTAL));

    scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..PER_THREAD {
                    let assigned = allocator.allocate(&hildesheim).unwrap();
                    seen.lock().push(assigned.id.get());
                }
            });
        }
    });

    let mut seen = seen.into_inner();
    seen.sort_unstable();
    let expected: Vec<u64> = (1..=TOTAL as u64).collect();
    assert_eq!(seen, expected);
}

#[test]
fn released_id_is_reused_before_minting() {
    let allocator = memory_allocator(AllocatorConfig::default());
    let s = site("goettingen");
    let held: Vec<Assignment> = (0..5).map(|_| allocator.allocate(&s).unwrap()).collect();
    let ids: Vec<u64> = held.iter().map(|a| a.id.get()).collect();
    assert_eq!(ids, [1, 2, 3, 4, 5]);

    allocator.release(&s, held[3]).unwrap();
    allocator.release(&s, held[1]).unwrap();

    assert_eq!(next_id(&allocator, &s), 2);
    assert_eq!(next_id(&allocator, &s), 4);
    assert_eq!(next_id(&allocator, &s), 6);
}

#[test]
fn cap_reached_reports_exhaustion_until_a_release() {
    let allocator = memory_allocator(AllocatorConfig {
        max_participants: Some(2),
        ..AllocatorConfig::default()
    });
    let s = site("hildesheim");
    let first = allocator.allocate(&s).unwrap();
    allocator.allocate(&s).unwrap();

    let err = allocator.allocate(&s).unwrap_err();
    assert_eq!(
        err,
        Error::Exhausted(Exhaustion::Ids {
            site: "hildesheim".into(),
            cap: 2
        })
    );
    assert!(!err.is_retryable());

    allocator.release(&s, first).unwrap();
    assert_eq!(next_id(&allocator, &s), 1);
}

#[test]
fn storage_failure_hands_out_nothing() {
    let store = Arc::new(MemorySequenceStore::new());
    let allocator = Allocator::new(Arc::clone(&store), AllocatorConfig::default());
    let s = site("hildesheim");

    store.set_unavailable(true);
    let err = allocator.allocate(&s).unwrap_err();
    assert!(matches!(err, Error::Storage { .. }));
    assert!(err.is_retryable());

    store.set_unavailable(false);
    let first = allocator.allocate(&s).unwrap();
    assert_eq!(first.id.get(), 1);

    store.set_unavailable(true);
    assert!(allocator.allocate(&s).is_err());
    assert!(allocator.release(&s, first).is_err());

    // Neither the failed allocation nor the failed release took effect.
    store.set_unavailable(false);
    assert_eq!(next_id(&allocator, &s), 2);
    let state = allocator.snapshot(&s).unwrap();
    assert_eq!(state.high_water, 2);
    assert!(state.released.is_empty());
    assert_eq!(store.load(&s).unwrap(), Some(state));
}

#[test]
fn release_only_accepts_outstanding_ids() {
    let allocator = memory_allocator(AllocatorConfig::default());
    let s = site("hildesheim");
    let first = allocator.allocate(&s).unwrap();
    let second = allocator.allocate(&s).unwrap();

    // never minted
    let ghost = Assignment {
        id: pid(9),
        lease: first.lease,
    };
    assert!(matches!(
        allocator.release(&s, ghost),
        Err(Error::Validation { .. })
    ));

    // right id, wrong lease
    let forged = Assignment {
        id: first.id,
        lease: second.lease,
    };
    assert!(matches!(
        allocator.release(&s, forged),
        Err(Error::Validation { .. })
    ));

    allocator.release(&s, first).unwrap();
    assert!(matches!(
        allocator.release(&s, first),
        Err(Error::Validation { .. })
    ));

    allocator.complete(&s, second).unwrap();
    assert!(matches!(
        allocator.release(&s, second),
        Err(Error::Validation { .. })
    ));
}

#[test]
fn complete_is_idempotent_but_rejects_unknown_ids() {
    let allocator = memory_allocator(AllocatorConfig::default());
    let s = site("hildesheim");
    let assigned = allocator.allocate(&s).unwrap();

    allocator.complete(&s, assigned).unwrap();
    allocator.complete(&s, assigned).unwrap();
    assert_eq!(allocator.snapshot(&s).unwrap().outstanding(), 0);

    let unknown = Assignment {
        id: pid(5),
        lease: assigned.lease,
    };
    assert!(allocator.complete(&s, unknown).is_err());

    let other = allocator.allocate(&s).unwrap();
    allocator.release(&s, other).unwrap();
    assert!(allocator.complete(&s, other).is_err());
}

#[test]
fn idle_leases_are_reclaimed_only_when_configured() {
    fn run(reclaim: ReclaimPolicy) -> u64 {
        let clock = MockTime::at(0);
        let allocator = Allocator::with_clock(
            MemorySequenceStore::new(),
            Arc::clone(&clock),
            AllocatorConfig {
                max_participants: None,
                reclaim,
            },
        );
        let s = site("hildesheim");

        assert_eq!(next_id(&allocator, &s), 1);
        clock.set(30_000);
        let second = allocator.allocate(&s).unwrap();
        allocator.complete(&s, second).unwrap();

        clock.set(61_000);
        next_id(&allocator, &s)
    }

    assert_eq!(run(ReclaimPolicy::AfterIdle(Duration::from_secs(60))), 1);
    assert_eq!(run(ReclaimPolicy::Never), 3);
}

#[test]
fn reclaim_leaves_fresh_leases_alone() {
    let clock = MockTime::at(10_000);
    let allocator = Allocator::with_clock(
        MemorySequenceStore::new(),
        Arc::clone(&clock),
        AllocatorConfig {
            max_participants: None,
            reclaim: ReclaimPolicy::AfterIdle(Duration::from_secs(5)),
        },
    );
    let s = site("hildesheim");
    allocator.allocate(&s).unwrap();
    clock.set(12_000);
    assert_eq!(next_id(&allocator, &s), 2);

    let state = allocator.snapshot(&s).unwrap();
    assert_eq!(state.leases.len(), 2);
    assert!(state.released.is_empty());
}

#[test]
fn state_survives_restart_with_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let s = site("goettingen");
    let third;
    {
        let store = FileSequenceStore::open(dir.path(), RetryPolicy::once()).unwrap();
        let allocator = Allocator::new(store, AllocatorConfig::default());
        let held: Vec<Assignment> = (0..3).map(|_| allocator.allocate(&s).unwrap()).collect();
        allocator.release(&s, held[1]).unwrap();
        third = held[2];
    }

    let store = FileSequenceStore::open(dir.path(), RetryPolicy::once()).unwrap();
    let allocator = Allocator::new(store, AllocatorConfig::default());
    let reused = allocator.allocate(&s).unwrap();
    assert_eq!(reused.id.get(), 2);
    assert!(reused.lease > third.lease, "serials keep counting across restarts");
    assert_eq!(next_id(&allocator, &s), 4);
    // A lease issued before the restart is still honoured.
    allocator.complete(&s, third).unwrap();
}

#[test]
fn sites_have_independent_counters() {
    let allocator = memory_allocator(AllocatorConfig::default());
    let a = site("hildesheim");
    let b = site("goettingen");
    assert_eq!(next_id(&allocator, &a), 1);
    assert_eq!(next_id(&allocator, &a), 2);
    assert_eq!(next_id(&allocator, &b), 1);
}

/// Store whose saves for one site block until the test opens the gate.
struct GatedStore {
    inner: MemorySequenceStore,
    gated: Site,
    gate: Mutex<()>,
    entered: AtomicBool,
}

impl SequenceStore for GatedStore {
    fn load(&self, site: &Site) -> Result<Option<SequenceState>> {
        self.inner.load(site)
    }

    fn save(&self, site: &Site, state: &SequenceState) -> Result<()> {
        if *site == self.gated {
            self.entered.store(true, Ordering::SeqCst);
            let _open = self.gate.lock();
        }
        self.inner.save(site, state)
    }
}

#[test]
fn slow_site_does_not_block_other_sites() {
    let slow = site("slow");
    let fast = site("fast");
    let allocator = Allocator::new(
        GatedStore {
            inner: MemorySequenceStore::new(),
            gated: slow.clone(),
            gate: Mutex::new(()),
            entered: AtomicBool::new(false),
        },
        AllocatorConfig::default(),
    );

    let gate = allocator.store.gate.lock();
    scope(|s| {
        let blocked = s.spawn(|| allocator.allocate(&slow).unwrap());

        while !allocator.store.entered.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
        // `slow` is parked inside its critical section right now.
        assert_eq!(next_id(&allocator, &fast), 1);
        assert_eq!(next_id(&allocator, &fast), 2);

        drop(gate);
        assert_eq!(blocked.join().unwrap().id.get(), 1);
    });
}

#[test]
fn concurrent_allocate_and_release_never_double_assign() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 200;

    let allocator = memory_allocator(AllocatorConfig {
        max_participants: Some(16),
        ..AllocatorConfig::default()
    });
    let s = site("hildesheim");
    let held = Mutex::new(HashSet::new());

    scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                for _ in 0..ROUNDS {
                    let assigned = match allocator.allocate(&s) {
                        Ok(assigned) => assigned,
                        Err(Error::Exhausted(_)) => continue,
                        Err(e) => panic!("unexpected error: {e}"),
                    };
                    let id = assigned.id;
                    assert!(held.lock().insert(id), "{id} handed out twice");
                    std::thread::yield_now();
                    assert!(held.lock().remove(&id));
                    allocator.release(&s, assigned).unwrap();
                }
            });
        }
    });

    let state = allocator.snapshot(&s).unwrap();
    assert_eq!(state.outstanding(), 0);
    assert!(state.high_water <= 16);
}

#[test]
fn reclaimed_holder_cannot_end_the_new_lease() {
    let clock = MockTime::at(0);
    let allocator = Allocator::with_clock(
        MemorySequenceStore::new(),
        Arc::clone(&clock),
        AllocatorConfig {
            max_participants: None,
            reclaim: ReclaimPolicy::AfterIdle(Duration::from_secs(60)),
        },
    );
    let s = site("hildesheim");

    let stale = allocator.allocate(&s).unwrap();
    clock.set(61_000);
    let current = allocator.allocate(&s).unwrap();
    assert_eq!(stale.id, current.id);

    // The session that lost the id to reclaim is turned away both ways.
    assert!(matches!(
        allocator.release(&s, stale),
        Err(Error::Validation { .. })
    ));
    assert!(matches!(
        allocator.complete(&s, stale),
        Err(Error::Validation { .. })
    ));

    // So the id is never handed to a third session while still held.
    let third = allocator.allocate(&s).unwrap();
    assert_ne!(third.id, current.id);
    assert_eq!(allocator.snapshot(&s).unwrap().outstanding(), 2);

    allocator.release(&s, current).unwrap();
    assert_eq!(allocator.allocate(&s).unwrap().id, current.id);
}

#[test]
fn lookups_for_unused_sites_leave_no_slot_behind() {
    let allocator = memory_allocator(AllocatorConfig::default());
    let ghost = site("ghost");

    assert_eq!(allocator.snapshot(&ghost).unwrap(), SequenceState::default());
    let stray = Assignment {
        id: pid(1),
        lease: 1,
    };
    assert!(allocator.release(&ghost, stray).is_err());
    assert!(allocator.complete(&ghost, stray).is_err());
    assert!(allocator.slots.lock().is_empty());

    let s = site("hildesheim");
    allocator.allocate(&s).unwrap();
    allocator.snapshot(&ghost).unwrap();
    assert_eq!(allocator.slots.lock().len(), 1);
    assert!(allocator.slots.lock().contains_key(&s));
}
