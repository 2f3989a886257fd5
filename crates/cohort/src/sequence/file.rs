use crate::{Error, Result, RetryPolicy, SequenceState, SequenceStore, Site, atomic};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

/// [`SequenceStore`] keeping one JSON document per site under a root
/// directory (`<root>/<site>.json`).
///
/// Saves go through write-then-rename, so a crash mid-save leaves the
/// previous state intact. Each filesystem call runs under the configured
/// [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct FileSequenceStore {
    root: PathBuf,
    retry: RetryPolicy,
}

impl FileSequenceStore {
    /// Opens (and creates if needed) the store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>, retry: RetryPolicy) -> Result<Self> {
        let root = root.into();
        retry
            .run(|| fs::create_dir_all(&root))
            .map_err(|e| Error::storage(format!("create {}", root.display()), e))?;
        Ok(Self { root, retry })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, site: &Site) -> PathBuf {
        self.root.join(format!("{site}.json"))
    }
}

impl SequenceStore for FileSequenceStore {
    fn load(&self, site: &Site) -> Result<Option<SequenceState>> {
        let path = self.path_for(site);
        let bytes = self.retry.run(|| match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        });
        let Some(bytes) = bytes.map_err(|e| Error::storage(format!("read {}", path.display()), e))?
        else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::storage(format!("corrupt sequence state {}", path.display()), e))
    }

    fn save(&self, site: &Site, state: &SequenceState) -> Result<()> {
        let path = self.path_for(site);
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| Error::storage(format!("encode state for `{site}`"), e))?;
        self.retry
            .run(|| atomic::publish(&path, &bytes))
            .map_err(|e| Error::storage(format!("write {}", path.display()), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(s: &str) -> Site {
        Site::new(s).unwrap()
    }

    #[test]
    fn unknown_site_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSequenceStore::open(dir.path(), RetryPolicy::once()).unwrap();
        assert_eq!(store.load(&site("hildesheim")).unwrap(), None);
    }

    #[test]
    fn saved_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = SequenceState::default();
        state.take_next(u64::MAX, 42);
        state.take_next(u64::MAX, 43);
        state.released.insert(state.high_water);
        state.leases.remove(&state.high_water);

        FileSequenceStore::open(dir.path(), RetryPolicy::once())
            .unwrap()
            .save(&site("goettingen"), &state)
            .unwrap();

        let reopened = FileSequenceStore::open(dir.path(), RetryPolicy::once()).unwrap();
        assert_eq!(reopened.load(&site("goettingen")).unwrap(), Some(state));
        assert!(dir.path().join("goettingen.json").is_file());
    }

    #[test]
    fn corrupt_state_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hildesheim.json"), b"{ not json").unwrap();
        let store = FileSequenceStore::open(dir.path(), RetryPolicy::once()).unwrap();
        let err = store.load(&site("hildesheim")).unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn unwritable_root_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSequenceStore::open(dir.path().join("seq"), RetryPolicy::once()).unwrap();
        fs::remove_dir_all(store.root()).unwrap();
        let err = store
            .save(&site("hildesheim"), &SequenceState::default())
            .unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
    }
}
