//! Error types for the message codec

use thiserror::Error;

/// Result type for message operations
pub type MessageResult<T> = Result<T, MessageError>;

/// Which part of a message a name belongs to.
///
/// The role decides the case rule applied when a name is validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameRole {
    /// Commands are uppercase only.
    Command,
    /// Server names, also accepts the reserved `.`, `*` and `?`.
    Server,
    /// Service names, also accepts the reserved `.`, `*` and `?`.
    Service,
    /// Parameter names.
    Parameter,
}

impl std::fmt::Display for NameRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NameRole::Command => "command",
            NameRole::Server => "server",
            NameRole::Service => "service",
            NameRole::Parameter => "parameter",
        };
        f.write_str(s)
    }
}

/// Errors raised while parsing, building or serializing a message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    /// The command is missing
    #[error("message has no command")]
    EmptyCommand,

    /// A name does not match `[A-Za-z_][A-Za-z0-9_]*` (or the uppercase variant)
    #[error("invalid {role} name {name:?}")]
    InvalidName { role: NameRole, name: String },

    /// A quoted parameter value has no closing quote
    #[error("unterminated quoted value for parameter {0:?}")]
    UnterminatedQuote(String),

    /// Something other than `;` follows a closing quote
    #[error("unexpected character after quoted value of parameter {0:?}")]
    TrailingAfterQuote(String),

    /// `:` found after a service name, or a second server name
    #[error("misplaced ':' in message routing prefix")]
    StrayColon,

    /// `/` found twice, or with no service name before it
    #[error("misplaced '/' in message routing prefix")]
    StraySlash,

    /// `server:` given without the following `service/`
    #[error("server name given without a service name")]
    ServerWithoutService,

    /// `<server:service ` prefix is truncated or has an empty service
    #[error("sent-from prefix is incomplete or has an empty service")]
    EmptySentFromService,

    /// `name` found with no `=value`
    #[error("parameter {0:?} has no value")]
    MissingValue(String),

    /// Lookup of a parameter that is not present
    #[error("parameter {0:?} not found")]
    ParameterNotFound(String),

    /// A parameter value could not be read as an integer
    #[error("parameter {name:?} value {value:?} is not an integer")]
    NotAnInteger { name: String, value: String },
}
