use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_histogram!(
            "fractory_render_ms",
            Unit::Milliseconds,
            "Wall time spent rendering a single fractal, including aborted renders."
        );
        describe_counter!(
            "fractory_render_too_complex_total",
            Unit::Count,
            "Total number of renders aborted for exceeding the time budget."
        );
        describe_counter!(
            "fractory_worker_messages_total",
            Unit::Count,
            "Total number of queue deliveries handled, labelled by disposition."
        );
        describe_counter!(
            "fractory_worker_failures_total",
            Unit::Count,
            "Total number of transient render failures left for redelivery."
        );
        describe_counter!(
            "fractory_status_stale_total",
            Unit::Count,
            "Total number of jobs failed by a staleness guard, labelled by reason."
        );
        describe_counter!(
            "fractory_read_cache_hit_total",
            Unit::Count,
            "Total number of list pages served from the read-cache."
        );
        describe_counter!(
            "fractory_read_cache_miss_total",
            Unit::Count,
            "Total number of list pages loaded from the repositories."
        );
        describe_counter!(
            "fractory_read_cache_evict_total",
            Unit::Count,
            "Total number of read-cache entries evicted due to capacity."
        );
    });
}
