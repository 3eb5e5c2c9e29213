//! Reactor configuration
//!
//! Compile-time defaults with runtime environment overrides, in the
//! same spirit as the scheduler configuration this crate grew out of.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (`from_env()` only)
//! 3. Library defaults
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use pollcomm_core::config::CommConfig;
//!
//! let config = CommConfig::new()
//!     .event_limit(20)
//!     .permanent_pause(Duration::from_secs(5));
//! assert_eq!(config.event_limit, 20);
//! ```

use std::str::FromStr;
use std::time::Duration;

pub mod defaults {
    //! Library defaults.

    /// Highest accepted priority (dispatched last).
    pub const MAX_PRIORITY: i32 = 255;
    /// Priority given to connections unless changed.
    pub const DEFAULT_PRIORITY: i32 = 100;
    /// Lines or messages processed per connection per pass.
    pub const EVENT_LIMIT: i64 = 5;
    /// Wall-clock budget per connection per pass, in microseconds.
    pub const PROCESSING_TIME_LIMIT_US: i64 = 500_000;
    /// Smallest repeating timeout accepted, in microseconds.
    pub const MIN_DELAY_US: i64 = 10;
    /// Hard ceiling for one UDP datagram.
    pub const UDP_MAX_DATAGRAM: usize = 1024;
    /// Pause between two reconnection attempts, in microseconds.
    pub const PERMANENT_PAUSE_US: i64 = 60_000_000;
    /// Bytes read from a stream per `read()` call.
    pub const READ_CHUNK_SIZE: usize = 1024;
}

/// Get environment variable parsed as type T, or return default.
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as optional value.
#[inline]
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get environment variable as boolean.
///
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Anything else that is set is false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Reactor configuration with builder pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommConfig {
    /// Priority assigned to connections created through the reactor
    pub default_priority: i32,
    /// Lines/messages processed per connection per pass
    pub event_limit: i64,
    /// Wall-clock budget per connection per pass
    pub processing_time_limit: Duration,
    /// UDP datagram ceiling in bytes
    pub udp_max_datagram: usize,
    /// Pause between reconnection attempts of permanent clients
    pub permanent_pause: Duration,
    /// Bytes requested per stream read
    pub read_chunk_size: usize,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl CommConfig {
    /// Create config from defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `POLLCOMM_DEFAULT_PRIORITY`
    /// - `POLLCOMM_EVENT_LIMIT`
    /// - `POLLCOMM_PROCESSING_TIME_LIMIT_US`
    /// - `POLLCOMM_UDP_MAX_DATAGRAM`
    /// - `POLLCOMM_PERMANENT_PAUSE_US`
    /// - `POLLCOMM_READ_CHUNK_SIZE`
    ///
    /// Out of range values fall back to the default.
    pub fn from_env() -> Self {
        let mut config = Self::new();

        let priority = env_get("POLLCOMM_DEFAULT_PRIORITY", defaults::DEFAULT_PRIORITY);
        if (0..=defaults::MAX_PRIORITY).contains(&priority) {
            config.default_priority = priority;
        }
        let limit = env_get("POLLCOMM_EVENT_LIMIT", defaults::EVENT_LIMIT);
        if limit >= 1 {
            config.event_limit = limit;
        }
        let time_limit = env_get("POLLCOMM_PROCESSING_TIME_LIMIT_US", defaults::PROCESSING_TIME_LIMIT_US);
        if time_limit >= 10_000 {
            config.processing_time_limit = Duration::from_micros(time_limit as u64);
        }
        let udp = env_get("POLLCOMM_UDP_MAX_DATAGRAM", defaults::UDP_MAX_DATAGRAM);
        if udp > 0 {
            config.udp_max_datagram = udp;
        }
        let pause = env_get("POLLCOMM_PERMANENT_PAUSE_US", defaults::PERMANENT_PAUSE_US);
        if pause >= 0 {
            config.permanent_pause = Duration::from_micros(pause as u64);
        }
        let chunk = env_get("POLLCOMM_READ_CHUNK_SIZE", defaults::READ_CHUNK_SIZE);
        if chunk > 0 {
            config.read_chunk_size = chunk;
        }

        config
    }

    /// Create config with library defaults only (no env override).
    pub fn new() -> Self {
        Self {
            default_priority: defaults::DEFAULT_PRIORITY,
            event_limit: defaults::EVENT_LIMIT,
            processing_time_limit: Duration::from_micros(defaults::PROCESSING_TIME_LIMIT_US as u64),
            udp_max_datagram: defaults::UDP_MAX_DATAGRAM,
            permanent_pause: Duration::from_micros(defaults::PERMANENT_PAUSE_US as u64),
            read_chunk_size: defaults::READ_CHUNK_SIZE,
        }
    }

    // Builder methods

    pub fn default_priority(mut self, priority: i32) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn event_limit(mut self, limit: i64) -> Self {
        self.event_limit = limit;
        self
    }

    pub fn processing_time_limit(mut self, d: Duration) -> Self {
        self.processing_time_limit = d;
        self
    }

    pub fn udp_max_datagram(mut self, size: usize) -> Self {
        self.udp_max_datagram = size;
        self
    }

    pub fn permanent_pause(mut self, d: Duration) -> Self {
        self.permanent_pause = d;
        self
    }

    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_uses_defaults() {
        let config = CommConfig::new();
        assert_eq!(config.default_priority, defaults::DEFAULT_PRIORITY);
        assert_eq!(config.event_limit, defaults::EVENT_LIMIT);
        assert_eq!(config.udp_max_datagram, 1024);
        assert_eq!(config.processing_time_limit, Duration::from_millis(500));
    }

    #[test]
    fn test_builder() {
        let config = CommConfig::new()
            .default_priority(10)
            .udp_max_datagram(512)
            .read_chunk_size(64);
        assert_eq!(config.default_priority, 10);
        assert_eq!(config.udp_max_datagram, 512);
        assert_eq!(config.read_chunk_size, 64);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("POLLCOMM_EVENT_LIMIT", "42");
        std::env::set_var("POLLCOMM_DEFAULT_PRIORITY", "999");
        let config = CommConfig::from_env();
        assert_eq!(config.event_limit, 42);
        // out of range, default kept
        assert_eq!(config.default_priority, defaults::DEFAULT_PRIORITY);
        std::env::remove_var("POLLCOMM_EVENT_LIMIT");
        std::env::remove_var("POLLCOMM_DEFAULT_PRIORITY");
    }

    #[test]
    fn test_env_helpers() {
        let val: usize = env_get("__POLLCOMM_TEST_UNSET__", 7);
        assert_eq!(val, 7);
        assert!(env_get_opt::<u32>("__POLLCOMM_TEST_UNSET__").is_none());

        std::env::set_var("__POLLCOMM_TEST_BOOL__", "Yes");
        assert!(env_get_bool("__POLLCOMM_TEST_BOOL__", false));
        std::env::set_var("__POLLCOMM_TEST_BOOL__", "nope");
        assert!(!env_get_bool("__POLLCOMM_TEST_BOOL__", true));
        std::env::remove_var("__POLLCOMM_TEST_BOOL__");
    }
}
