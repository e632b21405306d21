use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::ObservabilityConfig;

/// Initialize structured logging.
///
/// `RUST_LOG` wins over the configured level. Logs go to stderr so the `run`
/// session can keep stdout for its NDJSON responses.
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if config.json_logs {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .try_init()?;
    }

    tracing::info!("shipflow telemetry initialized");
    Ok(())
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span wrapping one state machine transition
pub fn transition_span(instance_id: &str, action: &str, actor: &str) -> tracing::Span {
    tracing::info_span!(
        "transition",
        instance.id = instance_id,
        action = action,
        actor = actor,
        correlation.id = %generate_correlation_id()
    )
}

/// Span wrapping one saga execution
pub fn saga_span(workflow_ref: &str, execution_id: &str) -> tracing::Span {
    tracing::info_span!(
        "saga",
        workflow = workflow_ref,
        execution.id = execution_id,
        correlation.id = %generate_correlation_id()
    )
}

pub fn shutdown_telemetry() {
    tracing::info!("shipflow telemetry shutdown complete");
}
