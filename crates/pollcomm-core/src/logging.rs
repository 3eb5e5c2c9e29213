//! Logging bootstrap
//!
//! Library code only emits `tracing` events. Binaries call [`init`] once
//! to get them printed on stderr.
//!
//! # Environment Variables
//!
//! - `POLLCOMM_LOG=<directive>` - full `EnvFilter` directive, e.g.
//!   `debug` or `pollcomm_runtime=trace,info`
//! - `POLLCOMM_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info,
//!   4=debug, 5=trace (names accepted too); used when `POLLCOMM_LOG`
//!   is not set

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Map a `POLLCOMM_LOG_LEVEL` value to an `EnvFilter` directive.
pub fn level_directive(value: &str) -> &'static str {
    match value.trim().to_lowercase().as_str() {
        "off" | "0" => "off",
        "error" | "1" => "error",
        "warn" | "2" => "warn",
        "info" | "3" => "info",
        "debug" | "4" => "debug",
        "trace" | "5" => "trace",
        _ => "info",
    }
}

fn filter_from_env() -> EnvFilter {
    if let Ok(directive) = std::env::var("POLLCOMM_LOG") {
        if let Ok(filter) = EnvFilter::try_new(&directive) {
            return filter;
        }
    }
    let level = std::env::var("POLLCOMM_LOG_LEVEL")
        .map(|v| level_directive(&v))
        .unwrap_or("info");
    EnvFilter::new(level)
}

/// Install the stderr subscriber. Later calls do nothing.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    // another subscriber may already be installed by the host program
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_from_env())
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_directive() {
        assert_eq!(level_directive("0"), "off");
        assert_eq!(level_directive("WARN"), "warn");
        assert_eq!(level_directive("4"), "debug");
        assert_eq!(level_directive("garbage"), "info");
    }

    #[test]
    fn test_init_twice() {
        init();
        init();
        tracing::info!("logging initialized");
    }
}
