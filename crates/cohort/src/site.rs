use crate::{Error, Result};
use core::fmt;
use serde::{Deserialize, Serialize};

/// Longest accepted site token.
pub const MAX_SITE_LEN: usize = 64;

/// A validated deployment token such as `"hildesheim"`.
///
/// Site tokens double as directory and file names in every store, so only
/// ASCII alphanumerics, `-` and `_` are accepted.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Site(String);

impl Site {
    /// Validates `token` and wraps it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when the token is empty, longer than
    /// [`MAX_SITE_LEN`], or contains anything but `[A-Za-z0-9_-]`.
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.is_empty() {
            return Err(Error::validation("site token is missing"));
        }
        if token.len() > MAX_SITE_LEN {
            return Err(Error::validation(format!(
                "site token exceeds {MAX_SITE_LEN} characters"
            )));
        }
        if !token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(Error::validation(format!(
                "site token `{token}` may only contain ASCII letters, digits, `-` and `_`"
            )));
        }
        Ok(Self(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Site {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Site {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Site> for String {
    fn from(site: Site) -> Self {
        site.0
    }
}

impl core::str::FromStr for Site {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}
