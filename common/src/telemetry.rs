//! Provides helper functions for initializing trace collection and export.
use anyhow::Result;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, Resource};
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter, Registry};

/// Initialize tracing.
///
/// Log lines always go to stderr, filtered by `RUST_LOG` and defaulting to
/// INFO. When an OTLP endpoint is given, spans are additionally exported
/// there in batches.
pub async fn init_tracing(otlp_endpoint: Option<String>) -> Result<()> {
    if let Some(otlp_endpoint) = otlp_endpoint {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(otlp_endpoint),
            )
            .with_trace_config(opentelemetry_sdk::trace::config().with_resource(Resource::new(
                vec![
                    opentelemetry::KeyValue::new(
                        "hostname",
                        gethostname::gethostname()
                            .into_string()
                            .expect("hostname should be valid utf-8"),
                    ),
                    opentelemetry::KeyValue::new("service.name", "kiln"),
                ],
            )))
            .install_batch(runtime::Tokio)?;

        let otlp_filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env()?;
        let telemetry = tracing_opentelemetry::layer()
            .with_tracer(tracer)
            .with_filter(otlp_filter);

        let log_filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env()?;
        let logger = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_filter(log_filter);

        tracing::subscriber::set_global_default(Registry::default().with(telemetry).with(logger))?;
    } else {
        let log_filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env()?;
        let logger = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_filter(log_filter);

        tracing_subscriber::registry().with(logger).init()
    }
    Ok(())
}

/// Flush any pending span batches before process exit.
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
}
