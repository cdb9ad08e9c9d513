//! Diagnostic output for the switch and its transport.
//!
//! Every component logs through `tracing`; this installs the fmt subscriber
//! that writes those events to stdout. Without a subscriber (as in tests)
//! the events are discarded.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub fn default_filter(debug: bool) -> &'static str {
    if debug {
        "dms=debug"
    } else {
        "dms=info"
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over `debug`.
pub fn init(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(debug)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_levels() {
        assert_eq!(default_filter(false), "dms=info");
        assert_eq!(default_filter(true), "dms=debug");
    }

    #[test]
    fn test_default_filters_parse() {
        for debug in [false, true] {
            assert!(default_filter(debug).parse::<EnvFilter>().is_ok());
        }
    }
}
