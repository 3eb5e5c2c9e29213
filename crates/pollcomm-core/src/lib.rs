//! # pollcomm-core
//!
//! Platform-agnostic pieces of the pollcomm reactor.
//!
//! ## Modules
//!
//! - `message` - text wire protocol (parse / serialize)
//! - `error` - codec error types
//! - `config` - reactor configuration with env overrides
//! - `logging` - `tracing` subscriber bootstrap for binaries
//! - `time` - microsecond wall-clock helpers

pub mod message;
pub mod error;
pub mod config;
pub mod logging;
pub mod time;

// Re-exports for convenience
pub use message::{verify_name, Message, BROADCAST_ALL, BROADCAST_ANY, LOCAL_ONLY};
pub use error::{MessageError, MessageResult, NameRole};
pub use config::{defaults, env_get, env_get_bool, env_get_opt, CommConfig};
pub use time::{current_date_us, NO_TIMEOUT};
