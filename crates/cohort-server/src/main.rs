#![doc = include_str!("../README.md")]

mod server;

use anyhow::{Context, bail};
use clap::Parser;
use cohort::{FileSequenceStore, StimulusList};
use server::config::{CliArgs, ServerConfig};
use server::service::handler::router;
use server::service::state::{AppState, SharedSequenceStore};
use server::telemetry::{TelemetryProviders, init_telemetry};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;
    let state = build_state(config.clone())?;

    if config.uds {
        #[cfg(unix)]
        {
            use tokio::net::UnixListener;
            let uds_path = config.server_addr.clone();
            let listener = UnixListener::bind(&uds_path)?;
            log_startup_info(&uds_path, &config);
            let res = axum::serve(listener, router(state.clone()))
                .with_graceful_shutdown(shutdown_signal(state, providers))
                .await;
            // Best effort; a panic can still leave the socket file behind.
            let _ = std::fs::remove_file(&uds_path);
            res?;
        }
        #[cfg(not(unix))]
        {
            bail!("Unix domain sockets are not supported on this platform");
        }
    } else {
        let listener = TcpListener::bind(&config.server_addr).await?;
        log_startup_info(&config.server_addr, &config);
        axum::serve(listener, router(state.clone()))
            .with_graceful_shutdown(shutdown_signal(state, providers))
            .await?;
    }

    tracing::info!("Service shut down successfully");
    Ok(())
}

/// Loads the stimulus list and opens every store under `DATA_DIR`.
fn build_state(config: ServerConfig) -> anyhow::Result<AppState> {
    let stimuli: StimulusList = StimulusList::load(&config.stimulus_file)
        .with_context(|| format!("loading {}", config.stimulus_file.display()))?;

    let capacity = stimuli.capacity(config.items_per_participant);
    if capacity == 0 {
        bail!(
            "{} holds {} stimuli, fewer than ITEMS_PER_PARTICIPANT ({})",
            config.stimulus_file.display(),
            stimuli.len(),
            config.items_per_participant
        );
    }

    if let Some(practice_file) = &config.practice_file {
        let practice: StimulusList = StimulusList::load(practice_file)
            .with_context(|| format!("loading {}", practice_file.display()))?;
        let overlap = stimuli.overlap_by_field(&practice, &config.practice_field);
        for item in &overlap {
            tracing::warn!(
                field = %config.practice_field,
                "practice trial also appears in the stimulus list: {item}"
            );
        }
        tracing::info!(
            practice = practice.len(),
            overlapping = overlap.len(),
            "checked practice trials against stimulus list"
        );
    }

    let sequences: SharedSequenceStore = Arc::new(
        FileSequenceStore::open(config.sequence_dir(), config.retry)
            .context("opening sequence store")?,
    );
    let state = AppState::open(config, sequences, stimuli).context("opening data stores")?;
    tracing::info!(
        stimuli = state.stimuli().len(),
        participants_per_site = capacity,
        "stimulus list loaded"
    );
    Ok(state)
}

fn log_startup_info(addr: &str, config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting cohort service on {addr} with full config: {config:#?}");
    } else {
        tracing::info!(
            "Starting cohort service on {} ({} items per participant, data in {})",
            addr,
            config.items_per_participant,
            config.data_dir.display()
        );
    }
}

async fn shutdown_signal(state: AppState, providers: TelemetryProviders) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");
    state.shutdown().await;
    providers.shutdown();
}
