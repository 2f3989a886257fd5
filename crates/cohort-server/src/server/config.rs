use anyhow::bail;
use clap::Parser;
use cohort::{ReclaimPolicy, RetryPolicy, Site};
use core::time::Duration;
use std::path::PathBuf;

/// Runtime configuration for the `cohort-server` binary.
///
/// Every value can be given as a CLI flag or an environment variable (a
/// `.env` file in the working directory is read first).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "cohort-server",
    version,
    about = "Allocates participant IDs, serves stimulus slices and stores results"
)]
pub struct CliArgs {
    /// Address to listen on (TCP or Unix socket path; use --uds for Unix
    /// socket).
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8080"))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be
    /// a file path.
    #[arg(short, long, default_value_t = false)]
    pub uds: bool,

    /// Root directory for sequence state, submissions and completion codes.
    ///
    /// Environment variable: `DATA_DIR`
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// JSON array with the ordered stimulus list shared by all sites.
    ///
    /// Environment variable: `STIMULUS_FILE`
    #[arg(long, env = "STIMULUS_FILE")]
    pub stimulus_file: PathBuf,

    /// Optional JSON array of practice trials. Practice items that also occur
    /// in the stimulus list are reported at startup.
    ///
    /// Environment variable: `PRACTICE_FILE`
    #[arg(long, env = "PRACTICE_FILE")]
    pub practice_file: Option<PathBuf>,

    /// Item field compared when checking practice trials for overlap.
    ///
    /// Environment variable: `PRACTICE_FIELD`
    #[arg(long, env = "PRACTICE_FIELD", default_value_t = String::from("presented_word"))]
    pub practice_field: String,

    /// Number of stimuli each participant receives.
    ///
    /// Environment variable: `ITEMS_PER_PARTICIPANT`
    #[arg(long, env = "ITEMS_PER_PARTICIPANT", default_value_t = 10)]
    pub items_per_participant: usize,

    /// Comma-separated list of provisioned site tokens. When empty, any
    /// well-formed site token is accepted.
    ///
    /// Environment variable: `SITES`
    #[arg(long, env = "SITES", value_delimiter = ',')]
    pub sites: Vec<String>,

    /// Highest participant ID per site. Defaults to, and may not exceed, the
    /// number of full stimulus slices.
    ///
    /// Environment variable: `MAX_PARTICIPANTS`
    #[arg(long, env = "MAX_PARTICIPANTS")]
    pub max_participants: Option<u64>,

    /// Return IDs that stayed unsubmitted for this many seconds to the free
    /// pool. Unset or `0` never reclaims.
    ///
    /// Environment variable: `RECLAIM_AFTER_SECS`
    #[arg(long, env = "RECLAIM_AFTER_SECS")]
    pub reclaim_after_secs: Option<u64>,

    /// Attempts per storage operation before the request fails.
    ///
    /// Environment variable: `STORAGE_RETRIES`
    #[arg(long, env = "STORAGE_RETRIES", default_value_t = 3)]
    pub storage_retries: u32,

    /// Initial backoff between storage attempts, doubled per retry.
    ///
    /// Environment variable: `STORAGE_BACKOFF_MS`
    #[arg(long, env = "STORAGE_BACKOFF_MS", default_value_t = 25)]
    pub storage_backoff_ms: u64,

    /// Upper bound on a single request's storage work. The participant is
    /// waiting, so a hung disk surfaces as an error instead of a hang.
    ///
    /// Environment variable: `REQUEST_TIMEOUT_MS`
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = 5_000)]
    pub request_timeout_ms: u64,

    /// How long shutdown waits for in-flight requests to drain.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 3)]
    pub shutdown_timeout_secs: u64,

    /// Largest accepted submission body.
    ///
    /// Environment variable: `MAX_PAYLOAD_BYTES`
    #[arg(long, env = "MAX_PAYLOAD_BYTES", default_value_t = 16 * 1024 * 1024)]
    pub max_payload_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub uds: bool,
    pub data_dir: PathBuf,
    pub stimulus_file: PathBuf,
    pub practice_file: Option<PathBuf>,
    pub practice_field: String,
    pub items_per_participant: usize,
    pub sites: Vec<Site>,
    pub max_participants: Option<u64>,
    pub reclaim: ReclaimPolicy,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub max_payload_bytes: usize,
}

impl ServerConfig {
    pub fn sequence_dir(&self) -> PathBuf {
        self.data_dir.join("sequences")
    }

    pub fn submission_dir(&self) -> PathBuf {
        self.data_dir.join("submissions")
    }

    pub fn completion_dir(&self) -> PathBuf {
        self.data_dir.join("completion_codes")
    }

    /// The per-site ID cap given a stimulus list of `stimulus_capacity` full
    /// slices.
    pub fn participant_cap(&self, stimulus_capacity: u64) -> u64 {
        self.max_participants
            .map_or(stimulus_capacity, |max| max.min(stimulus_capacity))
    }

    /// Whether `site` may be served.
    pub fn is_provisioned(&self, site: &Site) -> bool {
        self.sites.is_empty() || self.sites.contains(site)
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.items_per_participant == 0 {
            bail!("ITEMS_PER_PARTICIPANT must be greater than 0");
        }

        if args.max_participants == Some(0) {
            bail!("MAX_PARTICIPANTS must be greater than 0");
        }

        if args.storage_retries == 0 {
            bail!("STORAGE_RETRIES must be greater than 0");
        }

        if args.request_timeout_ms == 0 {
            bail!("REQUEST_TIMEOUT_MS must be greater than 0");
        }

        let mut sites = Vec::with_capacity(args.sites.len());
        for raw in args.sites.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            let site = Site::new(raw).map_err(|e| anyhow::anyhow!("SITES: {e}"))?;
            if !sites.contains(&site) {
                sites.push(site);
            }
        }

        Ok(Self {
            server_addr: args.server_addr,
            uds: args.uds,
            data_dir: args.data_dir,
            stimulus_file: args.stimulus_file,
            practice_file: args.practice_file,
            practice_field: args.practice_field,
            items_per_participant: args.items_per_participant,
            sites,
            max_participants: args.max_participants,
            reclaim: ReclaimPolicy::from_secs(args.reclaim_after_secs),
            retry: RetryPolicy {
                attempts: args.storage_retries,
                backoff: Duration::from_millis(args.storage_backoff_ms),
            },
            request_timeout: Duration::from_millis(args.request_timeout_ms),
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
            max_payload_bytes: args.max_payload_bytes,
        })
    }
}
