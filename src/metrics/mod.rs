//! Prometheus metrics through OpenTelemetry.
//!
//! Instruments are created from the global meter provider, so when
//! [`initialize_metrics`] was never called they are no-ops.

use std::path::Path;

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::new_view;
use opentelemetry_sdk::metrics::Aggregation;
use opentelemetry_sdk::metrics::Instrument;
use opentelemetry_sdk::metrics::MeterProvider;
use opentelemetry_sdk::metrics::Stream;
use prometheus::default_registry;
use prometheus::Encoder;
use prometheus::TextEncoder;

use crate::errors::EngineError;
use crate::errors::StoreError;
use crate::recovery::write_atomic;

#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}

fn setup_err(err: impl std::fmt::Display) -> EngineError {
    EngineError::Setup {
        what: "metrics",
        message: err.to_string(),
    }
}

/// Initialize the global registry for Prometheus metrics,
/// and create a global MeterProvider.
pub fn initialize_metrics() -> Result<(), EngineError> {
    // Initialize the global default registry for prometheus metrics
    // as internally it's a lazy static.
    let registry = default_registry();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace("simrun")
        .build()
        .map_err(setup_err)?;

    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(
            new_view(
                Instrument::new().name("*duration*"), // Must match histogram name
                Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                    boundaries: vec![
                        0.0, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0,
                        900.0, 3600.0,
                    ],
                    record_min_max: true,
                }),
            )
            .map_err(setup_err)?,
        )
        .with_view(
            new_view(
                Instrument::new().name("*bytes*"),
                Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                    boundaries: (20..=36).map(|exp| (1u64 << exp) as f64).collect(),
                    record_min_max: true,
                }),
            )
            .map_err(setup_err)?,
        )
        .build();
    global::set_meter_provider(provider);
    Ok(())
}

/// Dump the current state of the Prometheus registry in text format.
pub fn write_snapshot(file: &Path) -> Result<(), StoreError> {
    let mut buf = Vec::new();
    // Only fails on bad metric families, which the exporter doesn't build.
    if let Err(err) = TextEncoder::new().encode(&default_registry().gather(), &mut buf) {
        tracing::warn!("Can't encode metrics snapshot: {err}");
        return Ok(());
    }
    write_atomic(file, &buf)
}

/// Instruments recorded by the scheduler.
pub(crate) struct StepMetrics {
    pub(crate) step_duration: Histogram<f64>,
    pub(crate) chunk_duration: Histogram<f64>,
    pub(crate) chunk_peak_bytes: Histogram<u64>,
    pub(crate) commit_duration: Histogram<f64>,
    pub(crate) chunks_run: Counter<u64>,
}

impl StepMetrics {
    pub(crate) fn new() -> Self {
        let meter = global::meter("simrun");
        Self {
            step_duration: meter
                .f64_histogram("step_duration_seconds")
                .with_description("step execution duration in seconds, all chunks included")
                .init(),
            chunk_duration: meter
                .f64_histogram("chunk_duration_seconds")
                .with_description("duration of one chunk of a chunked step in seconds")
                .init(),
            chunk_peak_bytes: meter
                .u64_histogram("chunk_peak_bytes")
                .with_description("peak memory growth of one chunk")
                .init(),
            commit_duration: meter
                .f64_histogram("checkpoint_commit_duration_seconds")
                .with_description("checkpoint commit duration in seconds")
                .init(),
            chunks_run: meter
                .u64_counter("chunks_run")
                .with_description("number of chunks executed")
                .init(),
        }
    }

    pub(crate) fn labels(step: &str, worker: Option<usize>) -> Vec<KeyValue> {
        vec![
            KeyValue::new("step_name", step.to_string()),
            KeyValue::new("worker_index", worker.map_or(-1, |w| w as i64)),
        ]
    }
}

#[test]
fn timer_passes_result_through() {
    let metrics = StepMetrics::new();
    let labels = StepMetrics::labels("s", Some(0));
    let res: Result<u8, ()> = with_timer!(metrics.step_duration, labels, Ok(3));
    assert_eq!(res, Ok(3));
}
