use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LogSettings};

/// Install the global tracing subscriber for one of the binaries.
///
/// `RUST_LOG` wins when set; otherwise `settings.level` applies globally
/// with debug output for this crate and `tower_http`.
pub fn init_tracing(service: &str, settings: &LogSettings) {
    let registry = tracing_subscriber::registry().with(env_filter(&settings.level));

    match settings.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_line_number(true))
            .init(),
    }

    tracing::info!(
        service,
        level = %settings.level,
        format = settings.format.as_str(),
        "tracing initialized"
    );
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(level)))
}

fn default_directives(level: &str) -> String {
    let level = level.trim();
    let level = if level.is_empty() { "info" } else { level };
    format!("{level},ww_signal=debug,tower_http=debug")
}
