//! Process-wide tracing: human-readable logs on stderr, plus span export
//! through OpenTelemetry when `SWDL_OTEL` is set.
//!
//! ```no_run
//! swdl_observe::init_tracing("warn", swdl_observe::otel_requested()).unwrap();
//! // ... run the command ...
//! swdl_observe::shutdown_tracing();
//! ```

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Set to `1` or `true` to export spans.
pub const OTEL_ENV: &str = "SWDL_OTEL";

/// Instrumentation scope for exported spans.
const TRACER_NAME: &str = "swdl";

static PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

pub fn otel_requested() -> bool {
    std::env::var(OTEL_ENV).is_ok_and(|v| matches!(v.trim(), "1" | "true"))
}

/// `RUST_LOG` wins when it parses; otherwise the verbosity-derived default.
pub fn build_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Install the global subscriber.
///
/// Logs go to stderr so `--json` output on stdout stays machine-readable.
/// Stage and execution spans log their duration when they close.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(
    default_filter: &str,
    enable_otel: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let otel_layer = enable_otel.then(|| {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer(TRACER_NAME);
        let _ = PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
        tracing_opentelemetry::layer().with_tracer(tracer)
    });

    tracing_subscriber::registry()
        .with(build_filter(default_filter))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE),
        )
        .with(otel_layer)
        .try_init()?;

    Ok(())
}

/// Flush exported spans. Does nothing when export was never enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = PROVIDER.get()
        && let Err(e) = provider.shutdown()
    {
        eprintln!("warning: span exporter did not shut down cleanly: {e}");
    }
}
