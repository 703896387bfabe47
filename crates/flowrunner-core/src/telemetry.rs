//! Telemetry — structured logs plus optional OTLP trace export.
//!
//! Each process initializes one pipeline at startup, tagged with its
//! [`ServiceRole`] so that the events this crate emits — task dispatch
//! and lifecycle transitions from the control actor, child launch and
//! signal escalation from the supervisor, retry loops in the bus — can be
//! told apart per process in a shared collector. Spans export in batches
//! on the tokio runtime; the returned [`Telemetry`] guard flushes them on
//! shutdown, so hold it for the life of the process.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::TelemetryConfig;

/// Which process of the service is emitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRole {
    /// HTTP + WebSocket endpoint with an in-process worker set.
    Server,
    /// Standalone workers pulling from the shared queue.
    Worker,
    /// The periodic reconciler.
    Scheduler,
}

impl ServiceRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceRole::Server => "server",
            ServiceRole::Worker => "worker",
            ServiceRole::Scheduler => "scheduler",
        }
    }
}

/// Handle to the initialized pipeline. Dropping it shuts the tracer
/// provider down, flushing any spans still in the batch queue.
pub struct Telemetry {
    provider: Option<opentelemetry_sdk::trace::TracerProvider>,
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(err) = provider.shutdown() {
                eprintln!("flowrunner: trace export shutdown failed: {err}");
            }
        }
    }
}

/// Initialize structured JSON logging and, when enabled, OTLP export.
///
/// The default filter keeps this workspace's crates at debug — that is
/// where the task lifecycle, supervision, and bus-retry events live —
/// and everything else at info; `RUST_LOG` overrides it.
pub fn init(config: &TelemetryConfig, role: ServiceRole) -> anyhow::Result<Telemetry> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,flowrunner_core=debug,flowrunner_cli=debug"));
    let logs = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);
    let registry = tracing_subscriber::registry().with(filter).with(logs);

    if !config.enabled {
        registry.init();
        return Ok(Telemetry { provider: None });
    }

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()?;

    // Batch export: these processes are long-lived daemons, and a
    // per-span blocking exporter would stall the task control loops.
    let provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_resource(opentelemetry_sdk::Resource::new([
            KeyValue::new("service.name", "flowrunner"),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("flowrunner.role", role.as_str()),
        ]))
        .build();

    let tracer = provider.tracer(role.as_str());
    registry.with(tracing_opentelemetry::layer().with_tracer(tracer)).init();

    Ok(Telemetry {
        provider: Some(provider),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_names() {
        assert_eq!(ServiceRole::Server.as_str(), "server");
        assert_eq!(ServiceRole::Worker.as_str(), "worker");
        assert_eq!(ServiceRole::Scheduler.as_str(), "scheduler");
    }

    #[test]
    fn test_disabled_guard_carries_no_provider() {
        // Constructed directly: init() registers a global subscriber and
        // can only run once per process.
        let guard = Telemetry { provider: None };
        drop(guard);
    }
}
