//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! # Usage
//!
//! ```no_run
//! // Basic structured logging, `warn` unless RUST_LOG says otherwise
//! stepwise_observe::tracing_setup::init_tracing("warn", false).unwrap();
//! ```
//!
//! With `enable_otel`, spans (including the `chat` spans opened by model
//! calls) are exported to stdout.

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Stores the OTel tracer provider so it can be shut down cleanly on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Initialize the global tracing subscriber.
///
/// `default_filter` (e.g. `"warn"`, `"stepwise=debug"`) applies only when
/// `RUST_LOG` is unset. Logs go to stderr so `--json` output on stdout stays
/// machine-readable.
///
/// # Errors
///
/// Returns an error if the filter does not parse or the global subscriber
/// has already been set.
pub fn init_tracing(
    default_filter: &str,
    enable_otel: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(value) if !value.is_empty() => EnvFilter::try_new(value)?,
        _ => EnvFilter::try_new(default_filter)?,
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);

    if enable_otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("stepwise");
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);

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

/// Flush pending traces and shut down the OpenTelemetry tracer provider.
///
/// No-op when OTel was not enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get()
        && let Err(e) = provider.shutdown()
    {
        eprintln!("Warning: OTel tracer provider shutdown error: {e}");
    }
}

/// Map CLI verbosity (`-v` count, `--quiet`) to a default filter directive.
pub fn verbosity_filter(verbose: u8, quiet: bool) -> &'static str {
    if quiet {
        return "error";
    }
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_levels() {
        assert_eq!(verbosity_filter(0, false), "warn");
        assert_eq!(verbosity_filter(2, false), "debug");
        assert_eq!(verbosity_filter(9, false), "trace");
        assert_eq!(verbosity_filter(3, true), "error");
    }

    #[test]
    fn shutdown_without_otel_is_a_noop() {
        shutdown_tracing();
    }
}
