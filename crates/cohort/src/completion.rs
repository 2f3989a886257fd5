//! Append-only completion code log, one file per site.
//!
//! Each line is `<RFC 3339 timestamp>\t<code>\n`. Codes carry no link to a
//! participant ID. Every append holds an exclusive advisory lock on the log
//! file and writes its line in one call on an `O_APPEND` handle, so writers
//! in this process and in others never interleave. A failed append is
//! truncated back under the same lock, which means the rollback can only
//! ever cut its own partial line.

use crate::{Error, Result, RetryPolicy, Site};
use chrono::{DateTime, SecondsFormat, Utc};
use fs2::FileExt;
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

/// Longest accepted completion code, in characters.
pub const MAX_CODE_LEN: usize = 256;

/// One line of a site's completion log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionEntry {
    pub recorded_at: DateTime<Utc>,
    pub code: String,
}

/// Per-site append-only logs of free-text completion codes.
#[derive(Debug, Clone)]
pub struct CompletionLog {
    root: PathBuf,
    retry: RetryPolicy,
}

impl CompletionLog {
    /// Opens (and creates if needed) the log directory at `root`.
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

    /// Appends `code` (trimmed) to the log of `site`.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for an empty, overlong or multi-line code.
    /// - [`Error::Write`] if the line could not be durably appended.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(site = %site)))]
    pub fn append(&self, site: &Site, code: &str) -> Result<CompletionEntry> {
        let code = validate_code(code)?;
        let entry = CompletionEntry {
            recorded_at: Utc::now(),
            code: code.to_owned(),
        };
        let line = format!(
            "{}\t{}\n",
            entry.recorded_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            entry.code
        );

        let path = self.path_for(site);
        self.retry
            .run(|| append_line(&path, line.as_bytes()))
            .map_err(|e| Error::write(format!("append {}", path.display()), e))?;
        Ok(entry)
    }

    /// Every entry logged for `site`, in append order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the log cannot be read or a line does not
    /// parse.
    pub fn entries(&self, site: &Site) -> Result<Vec<CompletionEntry>> {
        let path = self.path_for(site);
        let text = match read_locked(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::storage(format!("read {}", path.display()), e)),
        };

        text.lines()
            .enumerate()
            .map(|(n, line)| {
                parse_line(line).ok_or_else(|| Error::Storage {
                    context: format!("corrupt line {} in {}", n + 1, path.display()),
                })
            })
            .collect()
    }

    fn path_for(&self, site: &Site) -> PathBuf {
        self.root.join(format!("{site}.log"))
    }
}

/// Trims `code` and checks it fits on one log line.
pub fn validate_code(code: &str) -> Result<&str> {
    let code = code.trim();
    if code.is_empty() {
        return Err(Error::validation("completion code is missing"));
    }
    if code.chars().count() > MAX_CODE_LEN {
        return Err(Error::validation(format!(
            "completion code exceeds {MAX_CODE_LEN} characters"
        )));
    }
    if code.chars().any(char::is_control) {
        return Err(Error::validation(
            "completion code must not contain control characters",
        ));
    }
    Ok(code)
}

fn append_line(path: &Path, line: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    // Released when `file` is closed.
    FileExt::lock_exclusive(&file)?;
    let start = file.metadata()?.len();
    if let Err(e) = file.write_all(line).and_then(|()| file.sync_data()) {
        return Err(roll_back(&file, start, e));
    }
    Ok(())
}

/// Cuts a failed append back to `start` and returns the error to report.
///
/// If the cut itself fails the log may end in half a line, so both failures
/// are reported together.
fn roll_back(file: &File, start: u64, cause: io::Error) -> io::Error {
    match file.set_len(start) {
        Ok(()) => cause,
        Err(rollback) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(start, "could not truncate a failed completion append: {rollback}");
            io::Error::new(
                cause.kind(),
                format!("{cause}; truncating back to {start} bytes also failed: {rollback}"),
            )
        }
    }
}

fn read_locked(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    FileExt::lock_shared(&file)?;
    let mut text = String::new();
    file.read_to_string(&mut text)?;
    Ok(text)
}

fn parse_line(line: &str) -> Option<CompletionEntry> {
    let (stamp, code) = line.split_once('\t')?;
    let recorded_at = DateTime::parse_from_rfc3339(stamp).ok()?.with_timezone(&Utc);
    Some(CompletionEntry {
        recorded_at,
        code: code.to_owned(),
    })
}
