//! Route table and request handlers.
//!
//! | method   | path                                         | purpose                  |
//! |----------|----------------------------------------------|--------------------------|
//! | `GET`    | `/health`                                    | liveness / drain status  |
//! | `POST`   | `/sites/{site}/participants`                 | allocate an ID + stimuli |
//! | `DELETE` | `/sites/{site}/participants/{id}?lease=N`    | release an abandoned ID  |
//! | `GET`    | `/sites/{site}/participants/{id}/stimuli`    | re-fetch an ID's slice   |
//! | `POST`   | `/sites/{site}/participants/{id}/complete?lease=N` | mark an ID consumed |
//! | `PUT`    | `/sites/{site}/submissions/{filename}`       | store a result payload   |
//! | `GET`    | `/sites/{site}/submissions/{filename}`       | read a payload back      |
//! | `GET`    | `/sites/{site}/progress`                     | monitoring counters      |
//! | `POST`   | `/sites/{site}/completion-codes`             | append a completion code |

use super::{
    error::{Error, Result},
    state::AppState,
};
use crate::server::telemetry::{
    increment_completion_codes, increment_exhaustions, increment_ids_allocated,
    increment_ids_released, increment_marker_failures, increment_request_errors,
    increment_requests, increment_submissions, record_request_duration,
};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use cohort::{Assignment, ParticipantId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};

/// Builds the service router around `state`.
pub fn router(state: AppState) -> Router {
    let max_payload = state.config().max_payload_bytes;
    Router::new()
        .route("/health", get(health))
        .route("/sites/{site}/participants", post(allocate))
        .route("/sites/{site}/participants/{id}", delete(release))
        .route("/sites/{site}/participants/{id}/stimuli", get(stimuli))
        .route("/sites/{site}/participants/{id}/complete", post(complete))
        .route(
            "/sites/{site}/submissions/{filename}",
            put(submit).get(read_submission),
        )
        .route("/sites/{site}/progress", get(progress))
        .route("/sites/{site}/completion-codes", post(append_code))
        .layer(DefaultBodyLimit::max(max_payload))
        .layer(middleware::from_fn_with_state(state.clone(), track_request))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Refuses work while draining and keeps the in-flight count and request
/// metrics.
async fn track_request(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if state.is_shutting_down() && req.uri().path() != "/health" {
        increment_request_errors();
        return Error::ServiceShutdown.into_response();
    }

    let _inflight = state.enter();
    let start = std::time::Instant::now();
    increment_requests();

    let response = next.run(req).await;

    if !response.status().is_success() {
        increment_request_errors();
    }
    record_request_duration(start.elapsed().as_secs_f64() * 1_000.0);
    response
}

async fn health(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.is_shutting_down() {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT_SERVING")
    } else {
        (StatusCode::OK, "SERVING")
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AssignmentResponse {
    pub participant_id: u64,
    /// Lease serial to present when releasing or completing the ID. Absent
    /// when the slice is merely re-fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<u64>,
    pub stimuli: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub struct LeaseParams {
    pub lease: Option<u64>,
}

/// Rebuilds the assignment a client holds from its path and query parts.
fn assignment(id: u64, lease: Option<u64>) -> Result<Assignment> {
    let id = ParticipantId::new(id)?;
    let lease = lease.ok_or_else(|| cohort::Error::Validation {
        reason: format!("the `lease` issued with participant {id} is required"),
    })?;
    Ok(Assignment { id, lease })
}

/// Allocates the next participant ID and returns it with its stimulus slice.
///
/// If the slice cannot be produced the ID is released again, so a failed
/// request never strands an ID.
#[tracing::instrument(skip(state))]
async fn allocate(
    State(state): State<AppState>,
    Path(site): Path<String>,
) -> Result<Json<AssignmentResponse>> {
    let site = state.site(&site)?;
    let site_label = site.to_string();

    let outcome = state
        .run_blocking(move |inner| {
            let assigned = inner.allocator.allocate(&site)?;
            match inner
                .stimuli
                .slice_for(assigned.id, inner.config.items_per_participant)
            {
                Ok(items) => Ok((assigned, items.to_vec())),
                Err(e) => {
                    if let Err(release_err) = inner.allocator.release(&site, assigned) {
                        tracing::error!(%assigned, "could not release unservable id: {release_err}");
                    }
                    Err(e)
                }
            }
        })
        .await;

    match outcome {
        Ok((assigned, items)) => {
            increment_ids_allocated(&site_label);
            tracing::info!(site = %site_label, %assigned, "assigned participant id");
            Ok(Json(AssignmentResponse {
                participant_id: assigned.id.get(),
                lease: Some(assigned.lease),
                stimuli: items,
            }))
        }
        Err(e) => {
            if matches!(e, Error::Cohort(cohort::Error::Exhausted(_))) {
                increment_exhaustions(&site_label);
                tracing::info!(site = %site_label, "study complete: {e}");
            }
            Err(e)
        }
    }
}

/// Returns the stimulus slice of an already assigned ID. Pure computation,
/// no storage access.
async fn stimuli(
    State(state): State<AppState>,
    Path((site, id)): Path<(String, u64)>,
) -> Result<Json<AssignmentResponse>> {
    state.site(&site)?;
    let id = ParticipantId::new(id)?;
    let items = state
        .stimuli()
        .slice_for(id, state.config().items_per_participant)?;
    Ok(Json(AssignmentResponse {
        participant_id: id.get(),
        lease: None,
        stimuli: items.to_vec(),
    }))
}

#[tracing::instrument(skip(state))]
async fn release(
    State(state): State<AppState>,
    Path((site, id)): Path<(String, u64)>,
    Query(params): Query<LeaseParams>,
) -> Result<StatusCode> {
    let site = state.site(&site)?;
    let assigned = assignment(id, params.lease)?;
    let site_label = site.to_string();
    state
        .run_blocking(move |inner| inner.allocator.release(&site, assigned))
        .await?;
    increment_ids_released(&site_label);
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(skip(state))]
async fn complete(
    State(state): State<AppState>,
    Path((site, id)): Path<(String, u64)>,
    Query(params): Query<LeaseParams>,
) -> Result<StatusCode> {
    let site = state.site(&site)?;
    let assigned = assignment(id, params.lease)?;
    state
        .run_blocking(move |inner| inner.allocator.complete(&site, assigned))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct SubmitParams {
    pub participant_id: Option<u64>,
    pub lease: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub filename: String,
    pub marker_written: bool,
    /// Whether the optional `participant_id` was marked consumed. `None` when
    /// no ID was given.
    pub participant_completed: Option<bool>,
}

/// Stores a result payload. With `?participant_id=&lease=` the ID is also
/// marked consumed; a failure there is logged but does not fail the request,
/// since the payload is already durable.
#[tracing::instrument(skip(state, params, payload), fields(bytes = payload.len()))]
async fn submit(
    State(state): State<AppState>,
    Path((site, filename)): Path<(String, String)>,
    Query(params): Query<SubmitParams>,
    payload: Bytes,
) -> Result<Json<SubmitResponse>> {
    let site = state.site(&site)?;
    let participant = params
        .participant_id
        .map(|id| assignment(id, params.lease))
        .transpose()?;
    let site_label = site.to_string();
    let name = filename.clone();

    let (receipt, participant_completed) = state
        .run_blocking(move |inner| {
            let receipt = inner.submissions.submit(&site, &name, &payload)?;
            let completed = participant.map(|assigned| {
                match inner.allocator.complete(&site, assigned) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(%assigned, "payload stored but id not marked complete: {e}");
                        false
                    }
                }
            });
            Ok((receipt, completed))
        })
        .await?;

    increment_submissions(&site_label);
    if !receipt.marker_written {
        increment_marker_failures(&site_label);
    }
    Ok(Json(SubmitResponse {
        filename,
        marker_written: receipt.marker_written,
        participant_completed,
    }))
}

async fn read_submission(
    State(state): State<AppState>,
    Path((site, filename)): Path<(String, String)>,
) -> Result<Response> {
    let site = state.site(&site)?;
    let name = filename.clone();
    let payload = state
        .run_blocking(move |inner| inner.submissions.read(&site, &name))
        .await?
        .ok_or(Error::NotFound {
            what: format!("submission `{filename}`"),
        })?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        payload,
    )
        .into_response())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProgressResponse {
    pub site: String,
    /// Progress markers on disk.
    pub completed: usize,
    pub high_water: u64,
    pub released: usize,
    pub outstanding: usize,
}

async fn progress(
    State(state): State<AppState>,
    Path(site): Path<String>,
) -> Result<Json<ProgressResponse>> {
    let site = state.site(&site)?;
    let response = state
        .run_blocking(move |inner| {
            let completed = inner.submissions.count_completed(&site)?;
            let snapshot = inner.allocator.snapshot(&site)?;
            Ok(ProgressResponse {
                site: site.to_string(),
                completed,
                high_water: snapshot.high_water,
                released: snapshot.released.len(),
                outstanding: snapshot.outstanding(),
            })
        })
        .await?;
    Ok(Json(response))
}

#[tracing::instrument(skip(state, code))]
async fn append_code(
    State(state): State<AppState>,
    Path(site): Path<String>,
    code: String,
) -> Result<StatusCode> {
    let site = state.site(&site)?;
    let site_label = site.to_string();
    state
        .run_blocking(move |inner| inner.completions.append(&site, &code))
        .await?;
    increment_completion_codes(&site_label);
    Ok(StatusCode::NO_CONTENT)
}
