mod buffer;
mod config;
mod influx;
mod pipeline;
mod redis_bus;
mod stats;
mod supervisor;
mod telemetry;

use crate::config::Config;
use crate::pipeline::PipelineSettings;
use crate::supervisor::{LiveConnector, Supervisor, SupervisorSettings};
use anyhow::Result;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sensor_logger=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "sensor-logger"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable; using ctrl-c only");
            }
        }
    }
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    tracing::info!(
        channel = %config.redis_channel,
        influxdb = %config.influxdb_base_url(),
        bucket = %config.influxdb_bucket,
        fresh_limit = config.fresh_limit,
        backlog_limit = config.backlog_limit,
        samples_trigger = config.samples_trigger,
        time_trigger_secs = config.time_trigger_secs,
        "starting sensor logger"
    );

    let pipeline_settings = PipelineSettings::from_config(&config);
    let supervisor_settings = SupervisorSettings::from_config(&config);
    let supervisor = Supervisor::new(
        LiveConnector::new(config),
        &pipeline_settings,
        supervisor_settings,
    );
    let stats_rx = supervisor.subscribe();

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        let last = stats_rx.borrow().clone();
        tracing::info!(
            state = ?last.state,
            buffered = last.fresh_len + last.backlog_len,
            last_report_uptime_secs = last.uptime_secs,
            "shutdown signal received; draining"
        );
        signal_cancel.cancel();
    });

    let summary = supervisor.run(cancel).await;
    tracing::info!(
        points_written = summary.points_written,
        points_dropped = summary.points_dropped,
        write_errors = summary.write_errors,
        "sensor logger stopped"
    );
    opentelemetry::global::shutdown_tracer_provider();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::normalize_otlp_http_endpoint;

    #[test]
    fn appends_traces_path_once() {
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/v1/traces"),
            "http://collector:4318/v1/traces"
        );
    }
}
