#![forbid(unsafe_code)]

//! Tracing, optional OTLP span export and the Prometheus exporter.

use std::net::SocketAddr;

use anyhow::Context as _;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

const DEFAULT_FILTER: &str = "info,roomcast_server=debug";

/// Flushes buffered spans when dropped.
#[must_use]
pub struct TelemetryGuard {
	tracer_provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
	fn drop(&mut self) {
		let Some(provider) = self.tracer_provider.take() else {
			return;
		};
		if let Err(e) = provider.shutdown() {
			eprintln!("failed to flush otlp spans: {e}");
		}
	}
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter and
/// `OTEL_EXPORTER_OTLP_ENDPOINT` turns on span export.
pub fn init_tracing(service_name: &'static str) -> TelemetryGuard {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
	let registry = tracing_subscriber::registry()
		.with(filter)
		.with(tracing_subscriber::fmt::layer().with_target(false));

	let Some(endpoint) = env_non_empty("OTEL_EXPORTER_OTLP_ENDPOINT") else {
		registry.init();
		return TelemetryGuard { tracer_provider: None };
	};

	match otlp_provider(&endpoint) {
		Ok(provider) => {
			let tracer = provider.tracer(service_name);
			opentelemetry::global::set_tracer_provider(provider.clone());
			registry.with(tracing_opentelemetry::layer().with_tracer(tracer)).init();
			info!(%endpoint, "otlp span export enabled");
			TelemetryGuard {
				tracer_provider: Some(provider),
			}
		}
		Err(e) => {
			registry.init();
			warn!(%endpoint, error = %format!("{e:#}"), "otlp span export disabled");
			TelemetryGuard { tracer_provider: None }
		}
	}
}

fn otlp_provider(endpoint: &str) -> anyhow::Result<SdkTracerProvider> {
	let exporter = opentelemetry_otlp::SpanExporter::builder()
		.with_tonic()
		.with_endpoint(endpoint)
		.build()
		.context("build otlp span exporter")?;
	Ok(SdkTracerProvider::builder().with_batch_exporter(exporter).build())
}

fn env_non_empty(key: &str) -> Option<String> {
	std::env::var(key)
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty())
}

/// Serve Prometheus metrics over HTTP on `addr`.
pub fn install_metrics_exporter(addr: SocketAddr) -> anyhow::Result<()> {
	metrics_exporter_prometheus::PrometheusBuilder::new()
		.with_http_listener(addr)
		.install()
		.with_context(|| format!("start metrics exporter on {addr}"))?;
	info!(%addr, "metrics exporter listening");
	Ok(())
}
