//! Logging setup.
//!
//! `RUST_LOG` takes precedence. Otherwise `DYNPLAN_DEBUG=1` (or `true`)
//! selects `debug`, and everything else logs at `info`.

use std::env;
use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt};

static DEBUG_ENABLED: OnceLock<bool> = OnceLock::new();

/// Check if debug mode is enabled via the DYNPLAN_DEBUG environment variable
#[inline]
pub fn debug_enabled() -> bool {
    *DEBUG_ENABLED.get_or_init(|| {
        env::var("DYNPLAN_DEBUG")
            .map(|v| flag_set(&v))
            .unwrap_or(false)
    })
}

fn flag_set(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn default_directive(debug: bool) -> &'static str {
    if debug { "debug" } else { "info" }
}

/// Install the global stderr subscriber. Safe to call more than once.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled())));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_debug_flag_values() {
        assert!(flag_set("1"));
        assert!(flag_set("TRUE"));
        assert!(!flag_set("0"));
        assert!(!flag_set("yes"));
    }

    #[test]
    fn debug_flag_selects_level() {
        assert_eq!(default_directive(true), "debug");
        assert_eq!(default_directive(false), "info");
    }
}
