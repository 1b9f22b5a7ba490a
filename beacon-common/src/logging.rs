//! Logging setup for Beacon binaries.
//!
//! # Noise Filtering
//!
//! HTTP and TLS internals (hyper, reqwest, h2, rustls) are clamped to `warn`
//! so dispatch and listener logs stay readable. `RUST_LOG` overrides all of it.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Modules that are filtered to warn level by default.
pub const NOISY_MODULES: &[&str] = &["hyper", "hyper_util", "reqwest", "h2", "rustls"];

/// Build the filter directive string for a base level.
fn filter_directives(log_level: &str) -> String {
    let mut directives = String::from(log_level);
    for module in NOISY_MODULES {
        directives.push_str(&format!(",{module}=warn"));
    }
    directives
}

fn build_filter(log_level: &str) -> EnvFilter {
    // Environment variable wins when set
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::new(filter_directives(log_level))
}

/// Initialize logging.
///
/// * `log_level` - base level (trace, debug, info, warn, error)
/// * `log_format` - "json" for structured output, anything else for human-readable
///
/// Logs go to stderr so that command output on stdout stays machine-readable.
pub fn init_logging(log_level: &str, log_format: &str) {
    let subscriber = tracing_subscriber::registry().with(build_filter(log_level));

    if log_format == "json" {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_target(true);
        let _ = subscriber.with(fmt_layer).try_init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(true)
            .with_file(false)
            .with_line_number(false);
        let _ = subscriber.with(fmt_layer).try_init();
    }

    tracing::debug!(
        log_level = %log_level,
        log_format = %log_format,
        noise_filtered = NOISY_MODULES.len(),
        "Logging initialized"
    );
}

/// Create a tracing span for a transport operation.
///
/// ```ignore
/// let span = transport_span!("discord", "deliver", kind = %envelope.kind);
/// ```
#[macro_export]
macro_rules! transport_span {
    ($transport:expr, $op:expr) => {
        tracing::info_span!("transport", transport = $transport, op = $op)
    };
    ($transport:expr, $op:expr, $($field:tt)*) => {
        tracing::info_span!("transport", transport = $transport, op = $op, $($field)*)
    };
}
