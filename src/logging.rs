//! Logging setup and redaction helpers

use tracing_subscriber::EnvFilter;

/// Install the global subscriber
///
/// `RUST_LOG` wins over `level` when set. Calling this twice is harmless;
/// the second call reports an error and keeps the first subscriber.
pub fn init(level: &str) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| format!("Invalid log level '{}': {}", level, e))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| format!("Failed to set subscriber: {}", e))
}

fn shorten(value: &str, head: usize, tail: usize) -> String {
    if value.len() <= head + tail || !value.is_ascii() {
        return value.to_string();
    }
    format!("{}..{}", &value[..head], &value[value.len() - tail..])
}

/// Resource tokens are capabilities; only log their ends
pub fn redact_token(token: &str) -> String {
    shorten(token, 6, 4)
}
