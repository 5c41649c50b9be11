//! Logging setup for the relay bot.
//!
//! Output is either structured JSON (one object per line, for log shippers) or
//! a human-readable format. HTTP and WebSocket transport crates are held at
//! `warn` so gateway heartbeats and connection churn do not drown out session
//! events. `RUST_LOG`, when set, replaces the computed filter entirely.
//!
//! Secrets and message bodies are never logged; use [`redact`] when a value
//! must be mentioned.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Transport crates filtered to `warn`.
pub const NOISY_MODULES: &[&str] = &[
    "hyper",
    "hyper_util",
    "reqwest",
    "h2",
    "rustls",
    "tungstenite",
    "tokio_tungstenite",
];

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    /// Parse a configured format name. Unknown names fall back to pretty.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

fn directives(log_level: &str) -> String {
    let level = log_level.trim();
    let mut directives = format!("{level},relay_bot={level},relay_common={level}");
    for module in NOISY_MODULES {
        directives.push_str(&format!(",{module}=warn"));
    }
    directives
}

fn build_filter(log_level: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    EnvFilter::try_new(directives(log_level)).unwrap_or_else(|_| EnvFilter::new(directives("info")))
}

/// Install the global subscriber.
///
/// `log_level` is a level name (`trace` .. `error`); an invalid level falls
/// back to `info`. Calling this twice keeps the first subscriber.
pub fn init_logging(log_level: &str, log_format: &str) {
    let filter = build_filter(log_level);
    let format = LogFormat::parse(log_format);

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_target(true)
                .with_file(true)
                .with_line_number(true);
            let _ = subscriber.with(fmt_layer).try_init();
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_ansi(true)
                .with_target(true)
                .with_file(false)
                .with_line_number(false);
            let _ = subscriber.with(fmt_layer).try_init();
        }
    }

    tracing::info!(log_level = %log_level, ?format, "Logging initialized");
}

/// Generate a new trace ID for following one event through the logs.
pub fn generate_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Redact a secret for log output, keeping only its length.
pub fn redact(secret: &str) -> String {
    format!("<redacted:{} chars>", secret.chars().count())
}
