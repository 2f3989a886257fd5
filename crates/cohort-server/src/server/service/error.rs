//! Error type of the HTTP service.
//!
//! Wraps [`cohort::Error`] and adds the failure modes that only exist at the
//! service boundary. Converted into a response with a JSON body:
//!
//! ```json
//! { "error": "exhausted", "message": "...", "retryable": false }
//! ```
//!
//! | kind             | status | retryable |
//! |------------------|--------|-----------|
//! | `validation`     | 400    | no        |
//! | `unknown_site`   | 404    | no        |
//! | `not_found`      | 404    | no        |
//! | `exhausted`      | 410    | no        |
//! | `write`          | 500    | yes       |
//! | `internal`       | 500    | yes       |
//! | `storage`        | 503    | yes       |
//! | `timeout`        | 503    | yes       |
//! | `shutting_down`  | 503    | yes       |

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use core::time::Duration;
use serde::Serialize;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A failure reported by the allocator or one of the stores.
    #[error(transparent)]
    Cohort(#[from] cohort::Error),

    /// The site token is well-formed but not provisioned for this deployment.
    #[error("site `{site}` is not provisioned")]
    UnknownSite { site: String },

    /// The requested record does not exist.
    #[error("{what} not found")]
    NotFound { what: String },

    /// Storage work did not finish within the request timeout.
    #[error("storage did not respond within {after:?}")]
    Timeout { after: Duration },

    /// The blocking storage task panicked or was cancelled.
    #[error("storage task failed: {context}")]
    TaskFailed { context: String },

    /// The service is draining and refuses new work.
    #[error("service is shutting down")]
    ServiceShutdown,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    retryable: bool,
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Cohort(cohort::Error::Validation { .. }) => StatusCode::BAD_REQUEST,
            Self::Cohort(cohort::Error::Exhausted(_)) => StatusCode::GONE,
            Self::Cohort(cohort::Error::Storage { .. })
            | Self::Timeout { .. }
            | Self::ServiceShutdown => StatusCode::SERVICE_UNAVAILABLE,
            Self::UnknownSite { .. } | Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Cohort(_) | Self::TaskFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cohort(cohort::Error::Validation { .. }) => "validation",
            Self::Cohort(cohort::Error::Exhausted(_)) => "exhausted",
            Self::Cohort(cohort::Error::Storage { .. }) => "storage",
            Self::Cohort(cohort::Error::Write { .. }) => "write",
            Self::Cohort(_) | Self::TaskFailed { .. } => "internal",
            Self::UnknownSite { .. } => "unknown_site",
            Self::NotFound { .. } => "not_found",
            Self::Timeout { .. } => "timeout",
            Self::ServiceShutdown => "shutting_down",
        }
    }

    /// Whether the client should retry the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cohort(e) => e.is_retryable(),
            Self::Timeout { .. } | Self::TaskFailed { .. } | Self::ServiceShutdown => true,
            Self::UnknownSite { .. } | Self::NotFound { .. } => false,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(kind = self.kind(), "request failed: {self}");
        } else {
            tracing::debug!(kind = self.kind(), "request rejected: {self}");
        }
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
            retryable: self.is_retryable(),
        };
        (status, Json(body)).into_response()
    }
}
