//! Text message codec
//!
//! One message is one line of text:
//!
//! ```text
//! ['<' from_server ':' from_service ' '] [[server ':'] service '/'] COMMAND [' ' name '=' value (';' name '=' value)*]
//! ```
//!
//! Values that contain `;` or start with `"` are written between double
//! quotes, with inner quotes escaped as `\"`. Backslash, newline and
//! carriage return are always escaped as `\\`, `\n` and `\r`.
//!
//! # Example
//!
//! ```
//! use pollcomm_core::message::Message;
//!
//! let msg = Message::parse("PING hello=world").unwrap();
//! assert_eq!(msg.command(), "PING");
//! assert_eq!(msg.get_parameter("hello").unwrap(), "world");
//! assert_eq!(msg.to_message().unwrap(), "PING hello=world");
//! ```

use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{MessageError, MessageResult, NameRole};

/// Routing target meaning "deliver locally only".
pub const LOCAL_ONLY: &str = ".";

/// Routing target meaning "broadcast to all".
pub const BROADCAST_ALL: &str = "*";

/// Routing target meaning "any one that can handle it".
pub const BROADCAST_ANY: &str = "?";

/// Check `name` against the naming rule of `role`.
///
/// Commands must match `[A-Z_][A-Z0-9_]*`, every other role
/// `[A-Za-z_][A-Za-z0-9_]*`. Servers and services also accept the
/// reserved routing tokens.
pub fn verify_name(name: &str, role: NameRole) -> MessageResult<()> {
    if matches!(role, NameRole::Server | NameRole::Service)
        && matches!(name, LOCAL_ONLY | BROADCAST_ALL | BROADCAST_ANY)
    {
        return Ok(());
    }

    let lowercase = role != NameRole::Command;
    let letter = |c: char| c == '_' || c.is_ascii_uppercase() || (lowercase && c.is_ascii_lowercase());

    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if letter(first) => chars.all(|c| letter(c) || c.is_ascii_digit()),
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(MessageError::InvalidName {
            role,
            name: name.to_string(),
        })
    }
}

/// A structured command with its routing and parameters.
///
/// The serialized form is cached; every mutator drops the cache.
#[derive(Debug, Clone, Default)]
pub struct Message {
    sent_from_server: String,
    sent_from_service: String,
    server: String,
    service: String,
    command: String,
    parameters: BTreeMap<String, String>,
    cached: OnceCell<String>,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.sent_from_server == other.sent_from_server
            && self.sent_from_service == other.sent_from_service
            && self.server == other.server
            && self.service == other.service
            && self.command == other.command
            && self.parameters == other.parameters
    }
}

impl Eq for Message {}

impl Message {
    /// Create a message with the given command and nothing else.
    pub fn new(command: &str) -> MessageResult<Self> {
        let mut msg = Self::default();
        msg.set_command(command)?;
        Ok(msg)
    }

    /// Parse one message from its text form.
    pub fn parse(text: &str) -> MessageResult<Self> {
        let mut msg = Self::default();
        let mut it = text.chars().peekable();

        if it.peek() == Some(&'<') {
            it.next();
            let mut from_server = String::new();
            loop {
                match it.next() {
                    Some(':') => break,
                    Some(' ') | None => return Err(MessageError::EmptySentFromService),
                    Some(c) => from_server.push(c),
                }
            }
            let mut from_service = String::new();
            loop {
                match it.next() {
                    Some(' ') => break,
                    None => return Err(MessageError::EmptySentFromService),
                    Some(c) => from_service.push(c),
                }
            }
            if from_service.is_empty() {
                return Err(MessageError::EmptySentFromService);
            }
            if !from_server.is_empty() {
                verify_name(&from_server, NameRole::Server)?;
            }
            verify_name(&from_service, NameRole::Service)?;
            msg.sent_from_server = from_server;
            msg.sent_from_service = from_service;
        }

        let mut token = String::new();
        let mut has_server = false;
        let mut has_service = false;
        while let Some(&c) = it.peek() {
            if c == ' ' {
                break;
            }
            it.next();
            match c {
                ':' => {
                    if has_server || has_service || token.is_empty() {
                        return Err(MessageError::StrayColon);
                    }
                    has_server = true;
                    msg.server = std::mem::take(&mut token);
                }
                '/' => {
                    if has_service || token.is_empty() {
                        return Err(MessageError::StraySlash);
                    }
                    has_service = true;
                    msg.service = std::mem::take(&mut token);
                }
                _ => token.push(c),
            }
        }
        if has_server && !has_service {
            return Err(MessageError::ServerWithoutService);
        }
        if token.is_empty() {
            return Err(MessageError::EmptyCommand);
        }
        if has_server {
            verify_name(&msg.server, NameRole::Server)?;
        }
        if has_service {
            verify_name(&msg.service, NameRole::Service)?;
        }
        verify_name(&token, NameRole::Command)?;
        msg.command = token;

        // consumes the separator, if any
        if it.next() == Some(' ') {
            while it.peek().is_some() {
                let mut name = String::new();
                loop {
                    match it.next() {
                        Some('=') => break,
                        Some(c) => name.push(c),
                        None => return Err(MessageError::MissingValue(name)),
                    }
                }
                verify_name(&name, NameRole::Parameter)?;

                let mut raw = String::new();
                if it.peek() == Some(&'"') {
                    it.next();
                    loop {
                        match it.next() {
                            None => return Err(MessageError::UnterminatedQuote(name)),
                            Some('"') => break,
                            Some('\\') => match it.next() {
                                Some('"') => raw.push('"'),
                                Some(n) => {
                                    raw.push('\\');
                                    raw.push(n);
                                }
                                None => return Err(MessageError::UnterminatedQuote(name)),
                            },
                            Some(c) => raw.push(c),
                        }
                    }
                    match it.next() {
                        None | Some(';') => {}
                        Some(_) => return Err(MessageError::TrailingAfterQuote(name)),
                    }
                } else {
                    loop {
                        match it.next() {
                            None | Some(';') => break,
                            Some(c) => raw.push(c),
                        }
                    }
                }
                msg.parameters.insert(name, unescape(&raw));
            }
        }

        Ok(msg)
    }

    /// Replace this message with the one parsed from `text`.
    ///
    /// On error `self` is left exactly as it was.
    pub fn from_message(&mut self, text: &str) -> MessageResult<()> {
        *self = Self::parse(text)?;
        Ok(())
    }

    /// Serialize the message. The result is cached until the next mutation.
    pub fn to_message(&self) -> MessageResult<String> {
        if let Some(s) = self.cached.get() {
            return Ok(s.clone());
        }
        if self.command.is_empty() {
            return Err(MessageError::EmptyCommand);
        }
        if !self.server.is_empty() && self.service.is_empty() {
            return Err(MessageError::ServerWithoutService);
        }

        let mut out = String::with_capacity(64);
        if !self.sent_from_service.is_empty() {
            out.push('<');
            out.push_str(&self.sent_from_server);
            out.push(':');
            out.push_str(&self.sent_from_service);
            out.push(' ');
        }
        if !self.service.is_empty() {
            if !self.server.is_empty() {
                out.push_str(&self.server);
                out.push(':');
            }
            out.push_str(&self.service);
            out.push('/');
        }
        out.push_str(&self.command);

        let mut sep = ' ';
        for (name, value) in &self.parameters {
            out.push(sep);
            out.push_str(name);
            out.push('=');
            out.push_str(&escape(value));
            sep = ';';
        }

        let _ = self.cached.set(out.clone());
        Ok(out)
    }

    /// Address this message back to whoever sent `original`.
    pub fn reply_to(&mut self, original: &Message) {
        self.server = original.sent_from_server.clone();
        self.service = original.sent_from_service.clone();
        self.touch();
    }

    pub fn sent_from_server(&self) -> &str {
        &self.sent_from_server
    }

    pub fn set_sent_from_server(&mut self, name: &str) -> MessageResult<()> {
        if !name.is_empty() {
            verify_name(name, NameRole::Server)?;
        }
        self.sent_from_server = name.to_string();
        self.touch();
        Ok(())
    }

    pub fn sent_from_service(&self) -> &str {
        &self.sent_from_service
    }

    pub fn set_sent_from_service(&mut self, name: &str) -> MessageResult<()> {
        if !name.is_empty() {
            verify_name(name, NameRole::Service)?;
        }
        self.sent_from_service = name.to_string();
        self.touch();
        Ok(())
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn set_server(&mut self, name: &str) -> MessageResult<()> {
        if !name.is_empty() {
            verify_name(name, NameRole::Server)?;
        }
        self.server = name.to_string();
        self.touch();
        Ok(())
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn set_service(&mut self, name: &str) -> MessageResult<()> {
        if !name.is_empty() {
            verify_name(name, NameRole::Service)?;
        }
        self.service = name.to_string();
        self.touch();
        Ok(())
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn set_command(&mut self, name: &str) -> MessageResult<()> {
        verify_name(name, NameRole::Command)?;
        self.command = name.to_string();
        self.touch();
        Ok(())
    }

    /// Add or replace a parameter. Any `Display` value is accepted.
    pub fn add_parameter<V: fmt::Display>(&mut self, name: &str, value: V) -> MessageResult<()> {
        verify_name(name, NameRole::Parameter)?;
        self.parameters.insert(name.to_string(), value.to_string());
        self.touch();
        Ok(())
    }

    /// Remove a parameter, returning its value if it was set.
    pub fn remove_parameter(&mut self, name: &str) -> Option<String> {
        let old = self.parameters.remove(name);
        if old.is_some() {
            self.touch();
        }
        old
    }

    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    pub fn get_parameter(&self, name: &str) -> MessageResult<&str> {
        self.parameters
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| MessageError::ParameterNotFound(name.to_string()))
    }

    pub fn get_integer_parameter(&self, name: &str) -> MessageResult<i64> {
        let value = self.get_parameter(name)?;
        value.parse().map_err(|_| MessageError::NotAnInteger {
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    /// Parameters in name order.
    pub fn parameters(&self) -> impl Iterator<Item = (&str, &str)> {
        self.parameters.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters.len()
    }

    #[inline]
    fn touch(&mut self) {
        self.cached.take();
    }
}

impl FromStr for Message {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.to_message().map_err(|_| fmt::Error)?;
        f.write_str(&text)
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    if out.contains(';') || out.starts_with('"') {
        format!("\"{}\"", out.replace('"', "\\\""))
    } else {
        out
    }
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut it = raw.chars();
    while let Some(c) = it.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match it.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_simple() {
        let msg = Message::parse("PING hello=world").unwrap();
        assert_eq!(msg.command(), "PING");
        assert_eq!(msg.get_parameter("hello").unwrap(), "world");
        assert_eq!(msg.parameter_count(), 1);
        assert_eq!(msg.to_message().unwrap(), "PING hello=world");
    }

    #[test]
    fn test_lowercase_command_rejected() {
        assert!(matches!(
            Message::parse("ping hello=world"),
            Err(MessageError::InvalidName { role: NameRole::Command, .. })
        ));
    }

    #[test]
    fn test_parse_full_routing() {
        let msg = Message::parse("<alpha:snapwatch beta:sitter/STATUS cpu=3;mem=12").unwrap();
        assert_eq!(msg.sent_from_server(), "alpha");
        assert_eq!(msg.sent_from_service(), "snapwatch");
        assert_eq!(msg.server(), "beta");
        assert_eq!(msg.service(), "sitter");
        assert_eq!(msg.command(), "STATUS");
        assert_eq!(msg.get_integer_parameter("cpu").unwrap(), 3);
        assert_eq!(msg.get_integer_parameter("mem").unwrap(), 12);
    }

    #[test]
    fn test_reserved_server_names() {
        let msg = Message::parse("*:svc/HELP").unwrap();
        assert_eq!(msg.server(), BROADCAST_ALL);
        let msg = Message::parse(".:svc/HELP").unwrap();
        assert_eq!(msg.server(), LOCAL_ONLY);
        assert_eq!(msg.to_message().unwrap(), ".:svc/HELP");
    }

    #[test]
    fn test_malformed_parameter_leaves_message_untouched() {
        let mut msg = Message::new("KEEP").unwrap();
        msg.add_parameter("x", 1).unwrap();
        let before = msg.clone();

        let err = msg.from_message("svc/CMD a=1;b=2;3").unwrap_err();
        assert_eq!(err, MessageError::MissingValue("3".into()));
        assert_eq!(msg, before);
        assert_eq!(msg.to_message().unwrap(), "KEEP x=1");
    }

    #[test]
    fn test_grammar_violations() {
        assert_eq!(Message::parse("").unwrap_err(), MessageError::EmptyCommand);
        assert_eq!(Message::parse("svc/").unwrap_err(), MessageError::EmptyCommand);
        assert_eq!(Message::parse("svc/x:CMD").unwrap_err(), MessageError::StrayColon);
        assert_eq!(Message::parse("a:b:c/CMD").unwrap_err(), MessageError::StrayColon);
        assert_eq!(Message::parse("a/b/CMD").unwrap_err(), MessageError::StraySlash);
        assert_eq!(Message::parse("srv:CMD").unwrap_err(), MessageError::ServerWithoutService);
        assert_eq!(Message::parse("<srv: CMD").unwrap_err(), MessageError::EmptySentFromService);
        assert_eq!(Message::parse("<srv CMD").unwrap_err(), MessageError::EmptySentFromService);
        assert_eq!(
            Message::parse("CMD a=\"open").unwrap_err(),
            MessageError::UnterminatedQuote("a".into())
        );
        assert_eq!(
            Message::parse("CMD a=\"x\"y").unwrap_err(),
            MessageError::TrailingAfterQuote("a".into())
        );
        assert!(matches!(
            Message::parse("CMD 9a=1"),
            Err(MessageError::InvalidName { role: NameRole::Parameter, .. })
        ));
    }

    #[test]
    fn test_quoting_law() {
        let values = [
            "a;b",
            "\"leading quote",
            "back\\slash",
            "line\nbreak",
            "carriage\rreturn",
            ";\\\"",
            "\\n is not a newline",
            "ends with backslash\\",
            "",
        ];
        for value in values {
            let mut msg = Message::new("SET").unwrap();
            msg.add_parameter("v", value).unwrap();
            let text = msg.to_message().unwrap();
            assert!(!text.contains('\n'), "newline leaked into {:?}", text);
            let back = Message::parse(&text).unwrap();
            assert_eq!(back.get_parameter("v").unwrap(), value, "wire form {:?}", text);
        }
    }

    #[test]
    fn test_round_trip_is_idempotent() {
        let mut msg = Message::new("REGISTER").unwrap();
        msg.set_sent_from_server("alpha").unwrap();
        msg.set_sent_from_service("images").unwrap();
        msg.set_server("*").unwrap();
        msg.set_service("snapcommunicator").unwrap();
        msg.add_parameter("service", "images").unwrap();
        msg.add_parameter("version", 1).unwrap();
        msg.add_parameter("note", "a;b").unwrap();

        let once = msg.to_message().unwrap();
        let parsed = Message::parse(&once).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.to_message().unwrap(), once);
    }

    #[test]
    fn test_invalid_mutation_keeps_state() {
        let mut msg = Message::new("PING").unwrap();
        let before = msg.to_message().unwrap();

        assert!(msg.set_command("Ping").is_err());
        assert!(msg.set_command("9LIVES").is_err());
        assert!(msg.set_service("bad-name").is_err());
        assert!(msg.add_parameter("has space", "x").is_err());

        assert_eq!(msg.command(), "PING");
        assert_eq!(msg.service(), "");
        assert_eq!(msg.to_message().unwrap(), before);
    }

    #[test]
    fn test_cache_invalidated_on_mutation() {
        let mut msg = Message::new("PING").unwrap();
        assert_eq!(msg.to_message().unwrap(), "PING");
        msg.add_parameter("n", 2).unwrap();
        assert_eq!(msg.to_message().unwrap(), "PING n=2");
        msg.set_command("PONG").unwrap();
        assert_eq!(msg.to_string(), "PONG n=2");
    }

    #[test]
    fn test_serialize_requires_command() {
        let msg = Message::default();
        assert_eq!(msg.to_message().unwrap_err(), MessageError::EmptyCommand);
    }

    #[test]
    fn test_reply_to() {
        let request = Message::parse("<alpha:images PING").unwrap();
        let mut reply = Message::new("PONG").unwrap();
        reply.reply_to(&request);
        assert_eq!(reply.to_message().unwrap(), "alpha:images/PONG");
    }

    #[test]
    fn test_integer_parameter_errors() {
        let msg = Message::parse("CMD n=abc").unwrap();
        assert!(matches!(
            msg.get_integer_parameter("n"),
            Err(MessageError::NotAnInteger { .. })
        ));
        assert_eq!(
            msg.get_parameter("missing").unwrap_err(),
            MessageError::ParameterNotFound("missing".into())
        );
    }
}
