//! Crash-safe storage of participant result files.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/<site>/<filename>        published payload
//! <root>/<site>/<filename>.done   zero-length progress marker
//! <root>/<site>/.tmp-*            in-flight writes, never visible by name
//! ```
//!
//! A payload is published with write-then-rename, so it is either fully
//! present or absent. The progress marker is written afterwards as a
//! separate best-effort step: monitoring counts markers without opening
//! payloads, but a missing marker says nothing about the payload.


use crate::{Error, Result, RetryPolicy, Site, atomic};
use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

/// Suffix appended to a submission filename to form its progress marker.
pub const MARKER_SUFFIX: &str = ".done";

/// Longest accepted submission filename, in bytes. The progress marker
/// (`<filename>.done`) must still fit the common 255-byte name limit.
pub const MAX_FILENAME_LEN: usize = 255 - MARKER_SUFFIX.len();

/// Outcome of a successful [`SubmissionStore::submit`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitReceipt {
    /// Where the payload now lives.
    pub path: PathBuf,
    /// `false` if the payload is durable but its marker could not be written.
    pub marker_written: bool,
}

/// Per-site namespace of submitted result files.
#[derive(Debug, Clone)]
pub struct SubmissionStore {
    root: PathBuf,
    retry: RetryPolicy,
}

impl SubmissionStore {
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

    /// Durably publishes `payload` as `filename` for `site`, then writes the
    /// progress marker.
    ///
    /// Submitting the same filename twice overwrites the first payload; the
    /// last completed write wins.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for a bad filename or an empty payload.
    /// - [`Error::Write`] if the payload could not be published. No marker is
    ///   written in that case.
    ///
    /// A marker failure is logged and reported through
    /// [`SubmitReceipt::marker_written`], never as an error.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(site = %site, filename = %filename, bytes = payload.len())))]
    pub fn submit(&self, site: &Site, filename: &str, payload: &[u8]) -> Result<SubmitReceipt> {
        validate_filename(filename)?;
        if payload.is_empty() {
            return Err(Error::validation("submission payload is missing"));
        }

        let dir = self.root.join(site.as_str());
        self.retry
            .run(|| fs::create_dir_all(&dir))
            .map_err(|e| Error::write(format!("create {}", dir.display()), e))?;

        let path = dir.join(filename);
        self.retry
            .run(|| atomic::publish(&path, payload))
            .map_err(|e| Error::write(format!("publish {}", path.display()), e))?;

        let marker = marker_path(&dir, filename);
        let marker_written = match self.retry.run(|| write_marker(&marker)) {
            Ok(()) => true,
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    marker = %marker.display(),
                    "payload stored but progress marker could not be written: {_e}"
                );
                false
            }
        };

        Ok(SubmitReceipt {
            path,
            marker_written,
        })
    }

    /// Reads a published payload back. `None` if nothing was submitted under
    /// `filename`.
    pub fn read(&self, site: &Site, filename: &str) -> Result<Option<Vec<u8>>> {
        validate_filename(filename)?;
        let path = self.root.join(site.as_str()).join(filename);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage(format!("read {}", path.display()), e)),
        }
    }

    /// Whether a progress marker exists for `filename`.
    pub fn has_marker(&self, site: &Site, filename: &str) -> Result<bool> {
        validate_filename(filename)?;
        let marker = marker_path(&self.root.join(site.as_str()), filename);
        marker
            .try_exists()
            .map_err(|e| Error::storage(format!("stat {}", marker.display()), e))
    }

    /// Number of progress markers for `site`, i.e. completed sessions as
    /// seen by monitoring. Payloads are not opened.
    pub fn count_completed(&self, site: &Site) -> Result<usize> {
        let dir = self.root.join(site.as_str());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::storage(format!("list {}", dir.display()), e)),
        };

        let mut count = 0;
        for entry in entries {
            let entry = entry.map_err(|e| Error::storage(format!("list {}", dir.display()), e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with('.') && name.ends_with(MARKER_SUFFIX) {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Checks that `filename` names a plain file inside a site namespace.
///
/// # Errors
///
/// Returns [`Error::Validation`] for empty or overlong names, names with path
/// separators or NUL bytes, names starting with `.`, and names that would
/// collide with a progress marker.
pub fn validate_filename(filename: &str) -> Result<()> {
    let reason = if filename.is_empty() {
        "submission filename is missing"
    } else if filename.len() > MAX_FILENAME_LEN {
        "submission filename is too long"
    } else if filename.contains(['/', '\\', '\0']) {
        "submission filename must not contain path separators or NUL"
    } else if filename.starts_with('.') {
        "submission filename must not start with `.`"
    } else if filename.ends_with(MARKER_SUFFIX) {
        "submission filename must not end with the progress marker suffix"
    } else {
        return Ok(());
    };
    Err(Error::validation(reason))
}

fn marker_path(dir: &Path, filename: &str) -> PathBuf {
    dir.join(format!("{filename}{MARKER_SUFFIX}"))
}

fn write_marker(path: &Path) -> io::Result<()> {
    File::create(path)?.sync_all()?;
    if let Some(dir) = path.parent() {
        atomic::sync_dir(dir)?;
    }
    Ok(())
}
