use crate::{Error, Result, SequenceState, SequenceStore, Site};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

/// In-process [`SequenceStore`] for tests, benches and throwaway runs.
///
/// Nothing survives the process. The store can be switched into an
/// "unavailable" mode to exercise storage failure paths.
#[derive(Debug, Default)]
pub struct MemorySequenceStore {
    states: Mutex<HashMap<Site, SequenceState>>,
    unavailable: AtomicBool,
    saves: AtomicUsize,
}

impl MemorySequenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent load and save fail with [`Error::Storage`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful saves so far.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn check_available(&self, op: &str, site: &Site) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::storage(
                format!("{op} `{site}`"),
                "memory store marked unavailable",
            ));
        }
        Ok(())
    }
}

impl SequenceStore for MemorySequenceStore {
    fn load(&self, site: &Site) -> Result<Option<SequenceState>> {
        self.check_available("load", site)?;
        Ok(self.states.lock().get(site).cloned())
    }

    fn save(&self, site: &Site, state: &SequenceState) -> Result<()> {
        self.check_available("save", site)?;
        self.states.lock().insert(site.clone(), state.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
