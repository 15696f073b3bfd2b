//! Optional Prometheus export over the router's observability counters
//! (spec §6 names no metrics endpoint explicitly; this is ambient
//! tooling carried from the teacher's `metrics::MetricsExporter`,
//! generalized from its router/observability pair to this crate's
//! event-sink model).

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::observability::TracingObservability;

/// Installs the global Prometheus recorder and republishes the
/// observability sink's event counters as `apikeyrouter_events_total`
/// gauges, the way the teacher's exporter republished
/// `ObservabilityLayer`/`CostAwareRouter` counters.
pub struct PrometheusExporter {
    observability: Arc<TracingObservability>,
}

impl PrometheusExporter {
    pub fn new(observability: Arc<TracingObservability>) -> Self {
        Self { observability }
    }

    /// Installs the recorder; call once at process startup.
    pub fn install(&self) -> Result<(), metrics_exporter_prometheus::BuildError> {
        PrometheusBuilder::new().install()?;
        info!("installed prometheus recorder for apikeyrouter metrics");
        Ok(())
    }

    /// Pushes the current event-counter snapshot into the `metrics`
    /// facade. Intended to be called on a periodic tick by the
    /// embedding application; this crate does not spawn its own timer.
    pub fn publish(&self) {
        for (event, count) in self.observability.snapshot() {
            metrics::gauge!("apikeyrouter_events_total", "event" => event).set(count as f64);
        }
    }
}
