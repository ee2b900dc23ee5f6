//! Logging setup for native hosts.
//!
//! The library itself only emits `tracing` events. Hosts that want them on
//! stderr call [`init_logging`] once at startup.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "wasm_spend=info";
const FORMAT_ENV: &str = "WASM_SPEND_LOG_FORMAT";

/// Installs a global subscriber filtered by `RUST_LOG`.
///
/// Set `WASM_SPEND_LOG_FORMAT=json` for JSON lines. Returns `false` if a
/// global subscriber was already installed.
pub fn init_logging() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let json = std::env::var(FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry.with(fmt::layer().json().with_target(true)).try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init()
    };
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice() {
        let first = init_logging();
        // a second call never panics, it only reports that a subscriber exists
        assert!(!init_logging() || !first);
    }
}
