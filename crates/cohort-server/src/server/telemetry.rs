//! # Logging and metrics
//!
//! Logs are always on: a `tracing-subscriber` registry with an `EnvFilter`
//! (`RUST_LOG`, default `info`) and a human-readable fmt layer.
//!
//! ## Feature matrix
//!
//! - `metrics`: OpenTelemetry counters and histograms for allocations,
//!   submissions and request outcomes.
//! - `stdout`: periodically export those metrics to stdout.
//!
//! Without `metrics`, every `increment_*`/`record_*` helper compiles to a
//! no-op, so call sites never need their own `cfg`.
//!
//! ```bash
//! cargo run -p cohort-server --features metrics,stdout -- --stimulus-file stimuli.json
//! ```

// Disallow using `stdout` without `metrics`
#[cfg(all(feature = "stdout", not(feature = "metrics")))]
compile_error!("The 'stdout' feature requires the 'metrics' feature to be enabled.");

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "metrics")]
use opentelemetry::{
    InstrumentationScope, KeyValue,
    metrics::{Counter, Histogram, Meter},
};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::{Resource, metrics as sdkmetrics};
#[cfg(feature = "metrics")]
use opentelemetry_semantic_conventions as semvcns;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

pub struct TelemetryProviders {
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and stops exporters. Errors go to stderr because the
    /// subscriber may already be gone.
    pub fn shutdown(&self) {
        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true),
        );
    registry.try_init()?;

    #[cfg(feature = "metrics")]
    let meter_provider = {
        let meter_provider = init_metrics();
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let scope = InstrumentationScope::builder("cohort")
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_schema_url(semvcns::SCHEMA_URL)
            .build();
        init_metric_handles(&opentelemetry::global::meter_with_scope(scope));
        meter_provider
    };

    Ok(TelemetryProviders {
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(feature = "metrics")]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name("cohort")
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> sdkmetrics::SdkMeterProvider {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        let exporter = opentelemetry_stdout::MetricExporter::default();
        let reader = sdkmetrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();
        builder.with_reader(reader)
    };

    builder.build()
}

#[cfg(feature = "metrics")]
static REQUESTS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REQUEST_ERRORS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REQUEST_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static IDS_ALLOCATED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static IDS_RELEASED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static EXHAUSTIONS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static SUBMISSIONS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static MARKER_FAILURES: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static COMPLETION_CODES: OnceLock<Counter<u64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: &Meter) {
    let counter = |name: &'static str, description: &'static str| {
        meter.u64_counter(name).with_description(description).build()
    };

    let _ = REQUESTS.set(counter("requests", "Total HTTP requests"));
    let _ = REQUEST_ERRORS.set(counter("request_errors", "Requests answered with an error"));
    let _ = REQUEST_DURATION_MS.set(
        meter
            .f64_histogram("request_duration")
            .with_unit("ms")
            .with_description("End-to-end request duration")
            .build(),
    );
    let _ = IDS_ALLOCATED.set(counter("ids_allocated", "Participant IDs handed out"));
    let _ = IDS_RELEASED.set(counter("ids_released", "Participant IDs returned to the pool"));
    let _ = EXHAUSTIONS.set(counter("exhaustions", "Allocations refused as study complete"));
    let _ = SUBMISSIONS.set(counter("submissions", "Result payloads stored"));
    let _ = MARKER_FAILURES.set(counter("marker_failures", "Progress markers not written"));
    let _ = COMPLETION_CODES.set(counter("completion_codes", "Completion codes appended"));
}

#[cfg(feature = "metrics")]
fn add(counter: &OnceLock<Counter<u64>>, site: Option<&str>) {
    if let Some(counter) = counter.get() {
        match site {
            Some(site) => counter.add(1, &[KeyValue::new("site", site.to_owned())]),
            None => counter.add(1, &[]),
        }
    }
}

#[cfg(feature = "metrics")]
pub fn increment_requests() {
    add(&REQUESTS, None);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_requests() {}

#[cfg(feature = "metrics")]
pub fn increment_request_errors() {
    add(&REQUEST_ERRORS, None);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_request_errors() {}

#[cfg(feature = "metrics")]
pub fn record_request_duration(duration_ms: f64) {
    if let Some(histogram) = REQUEST_DURATION_MS.get() {
        histogram.record(duration_ms, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_request_duration(_duration_ms: f64) {}

#[cfg(feature = "metrics")]
pub fn increment_ids_allocated(site: &str) {
    add(&IDS_ALLOCATED, Some(site));
}

#[cfg(not(feature = "metrics"))]
pub fn increment_ids_allocated(_site: &str) {}

#[cfg(feature = "metrics")]
pub fn increment_ids_released(site: &str) {
    add(&IDS_RELEASED, Some(site));
}

#[cfg(not(feature = "metrics"))]
pub fn increment_ids_released(_site: &str) {}

#[cfg(feature = "metrics")]
pub fn increment_exhaustions(site: &str) {
    add(&EXHAUSTIONS, Some(site));
}

#[cfg(not(feature = "metrics"))]
pub fn increment_exhaustions(_site: &str) {}

#[cfg(feature = "metrics")]
pub fn increment_submissions(site: &str) {
    add(&SUBMISSIONS, Some(site));
}

#[cfg(not(feature = "metrics"))]
pub fn increment_submissions(_site: &str) {}

#[cfg(feature = "metrics")]
pub fn increment_marker_failures(site: &str) {
    add(&MARKER_FAILURES, Some(site));
}

#[cfg(not(feature = "metrics"))]
pub fn increment_marker_failures(_site: &str) {}

#[cfg(feature = "metrics")]
pub fn increment_completion_codes(site: &str) {
    add(&COMPLETION_CODES, Some(site));
}

#[cfg(not(feature = "metrics"))]
pub fn increment_completion_codes(_site: &str) {}
