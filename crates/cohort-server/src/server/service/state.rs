//! Shared service state.
//!
//! All storage components are synchronous and do blocking filesystem I/O.
//! Handlers hand them to [`AppState::run_blocking`], which moves the work onto
//! Tokio's blocking pool and bounds it by the configured request timeout.

use super::error::{Error, Result};
use crate::server::config::ServerConfig;
use cohort::{
    Allocator, AllocatorConfig, CompletionLog, SequenceStore, Site, StimulusList, SubmissionStore,
};
use core::time::Duration;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// The sequence store the service allocates against.
pub type SharedSequenceStore = Arc<dyn SequenceStore + Send + Sync>;

pub struct Inner {
    pub config: ServerConfig,
    pub allocator: Allocator<SharedSequenceStore>,
    pub stimuli: StimulusList,
    pub submissions: SubmissionStore,
    pub completions: CompletionLog,
    shutdown_token: CancellationToken,
    inflight: AtomicUsize,
}

/// Cheaply cloneable handle given to every handler.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

impl AppState {
    /// Wires the allocator and stores under `config.data_dir`.
    ///
    /// The per-site ID cap is the smaller of `MAX_PARTICIPANTS` and the number
    /// of full stimulus slices, so every issued ID has stimuli.
    pub fn open(
        config: ServerConfig,
        sequences: SharedSequenceStore,
        stimuli: StimulusList,
    ) -> cohort::Result<Self> {
        let cap = config.participant_cap(stimuli.capacity(config.items_per_participant));
        let allocator = Allocator::new(
            sequences,
            AllocatorConfig {
                max_participants: Some(cap),
                reclaim: config.reclaim,
            },
        );
        let submissions = SubmissionStore::open(config.submission_dir(), config.retry)?;
        let completions = CompletionLog::open(config.completion_dir(), config.retry)?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                allocator,
                stimuli,
                submissions,
                completions,
                shutdown_token: CancellationToken::new(),
                inflight: AtomicUsize::new(0),
            }),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn stimuli(&self) -> &StimulusList {
        &self.inner.stimuli
    }

    /// Validates a site token from a request path.
    pub fn site(&self, raw: &str) -> Result<Site> {
        let site = Site::new(raw)?;
        if !self.inner.config.is_provisioned(&site) {
            return Err(Error::UnknownSite { site: raw.to_owned() });
        }
        Ok(site)
    }

    /// Runs blocking storage work off the async runtime.
    ///
    /// The caller gets [`Error::Timeout`] once the request timeout elapses.
    /// The blocking task itself cannot be interrupted and still runs to
    /// completion; an ID it allocates after the timeout is simply never seen
    /// by the client and stays assigned until released or reclaimed.
    pub async fn run_blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Inner) -> cohort::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let after = inner.config.request_timeout;
        let task = tokio::task::spawn_blocking(move || op(&inner));
        match timeout(after, task).await {
            Ok(Ok(result)) => result.map_err(Error::from),
            Ok(Err(join_err)) => Err(Error::TaskFailed {
                context: join_err.to_string(),
            }),
            Err(_) => Err(Error::Timeout { after }),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown_token.is_cancelled()
    }

    pub fn inflight(&self) -> usize {
        self.inner.inflight.load(Ordering::SeqCst)
    }

    /// Counts a request as in flight until the guard drops.
    pub fn enter(&self) -> InflightGuard {
        self.inner.inflight.fetch_add(1, Ordering::SeqCst);
        InflightGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Gracefully stops accepting work.
    ///
    /// - Flags the service as shutting down; new requests get 503.
    /// - Waits up to `config.shutdown_timeout` for in-flight requests to
    ///   finish.
    pub async fn shutdown(&self) {
        // === Phase 0: Stop accepting new requests ===
        tracing::info!("Refusing new requests");
        self.inner.shutdown_token.cancel();

        // === Phase 1: Wait for in-flight requests to drain ===
        tracing::info!("Draining in-flight requests ({} active)", self.inflight());
        let drain = timeout(self.inner.config.shutdown_timeout, async {
            while self.inflight() > 0 {
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await;

        match drain {
            Ok(()) => tracing::debug!("All in-flight requests drained"),
            Err(_) => tracing::warn!(
                "Graceful drain timed out ({} requests still active)",
                self.inflight()
            ),
        }
    }
}

pub struct InflightGuard {
    inner: Arc<Inner>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inner.inflight.fetch_sub(1, Ordering::SeqCst);
    }
}
