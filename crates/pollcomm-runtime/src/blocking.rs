//! Blocking message client
//!
//! A private, synchronous loop for one-shot request/response exchanges
//! outside the reactor: connect, send, then [`run`] until the handler
//! calls `mark_done`. Timeouts, errors, hangups and invalid sockets end
//! the loop with an error; nothing is retried.
//!
//! [`run`]: BlockingMessageConnection::run

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;

use pollcomm_core::time::{current_date_us, NO_TIMEOUT};
use pollcomm_core::Message;

use crate::connection::ConnectionBase;
use crate::error::{CommError, CommResult};
use crate::fd;
use crate::stream::MessageSender;

/// Reply path for a blocking handler.
pub struct BlockingLink<'a> {
    stream: &'a mut TcpStream,
    base: &'a mut ConnectionBase,
}

impl BlockingLink<'_> {
    pub fn base(&self) -> &ConnectionBase {
        self.base
    }
}

impl MessageSender for BlockingLink<'_> {
    fn send_message(&mut self, message: &Message) -> CommResult<()> {
        write_message(self.stream, self.base.name(), message)
    }

    fn mark_done(&mut self) {
        self.base.mark_done();
    }
}

pub trait BlockingHandler {
    /// `link` is a [`BlockingLink`] over the client's stream.
    fn process_message(&mut self, link: &mut dyn MessageSender, message: Message);
}

impl<F> BlockingHandler for F
where
    F: FnMut(&mut dyn MessageSender, Message),
{
    fn process_message(&mut self, link: &mut dyn MessageSender, message: Message) {
        self(link, message)
    }
}

/// Write a message and its newline in a single call.
fn write_message(stream: &mut TcpStream, name: &str, message: &Message) -> CommResult<()> {
    let mut text = message.to_message()?;
    text.push('\n');
    let written = loop {
        match stream.write(text.as_bytes()) {
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CommError::Io(e)),
        }
    };
    if written != text.len() {
        tracing::warn!(connection = name, written, size = text.len(), "short blocking write");
        return Err(CommError::SocketError(name.to_string()));
    }
    Ok(())
}

pub struct BlockingMessageConnection {
    base: ConnectionBase,
    stream: TcpStream,
    peer: SocketAddr,
}

impl BlockingMessageConnection {
    /// Connect (blocking) to `addr:port`.
    pub fn connect(addr: &str, port: u16) -> CommResult<Self> {
        let stream = TcpStream::connect((addr, port))?;
        let peer = stream.peer_addr()?;
        tracing::debug!(%peer, "blocking client connected");
        Ok(Self {
            base: ConnectionBase::new(format!("blocking {}", peer)),
            stream,
            peer,
        })
    }

    pub fn base(&self) -> &ConnectionBase {
        &self.base
    }

    /// Bound the whole exchange (see [`ConnectionBase::set_timeout_date`]
    /// and [`ConnectionBase::set_timeout_delay`]).
    pub fn base_mut(&mut self) -> &mut ConnectionBase {
        &mut self.base
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Send one message. `true` only if the OS took all of it at once.
    pub fn send_message(&mut self, message: &Message) -> bool {
        match write_message(&mut self.stream, self.base.name(), message) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(connection = %self.base.name(), error = %e, "blocking send failed");
                false
            }
        }
    }

    pub fn mark_done(&mut self) {
        self.base.mark_done();
    }

    /// Read and dispatch messages until the handler marks the link done.
    pub fn run<H: BlockingHandler>(&mut self, handler: &mut H) -> CommResult<()> {
        let mut line = Vec::new();
        while !self.base.is_done() {
            let timeout = self.wait_time()?;
            let outcome = fd::poll_one(
                self.stream.as_raw_fd(),
                libc::POLLIN | libc::POLLPRI | libc::POLLRDHUP,
                timeout,
            )?;
            let Some(outcome) = outcome else {
                return Err(CommError::Timeout(self.base.name().to_string()));
            };
            if outcome.invalid {
                return Err(CommError::InvalidSocket(self.base.name().to_string()));
            }
            if outcome.error {
                return Err(CommError::SocketError(self.base.name().to_string()));
            }
            if !outcome.readable {
                return Err(CommError::Hangup(self.base.name().to_string()));
            }

            if self.read_byte(&mut line)? {
                let text = String::from_utf8_lossy(&line).into_owned();
                line.clear();
                match Message::parse(&text) {
                    Ok(message) => {
                        let mut link = BlockingLink {
                            stream: &mut self.stream,
                            base: &mut self.base,
                        };
                        handler.process_message(&mut link, message);
                    }
                    Err(e) => {
                        tracing::warn!(connection = %self.base.name(), error = %e, line = %text, "dropping malformed message");
                    }
                }
            }
        }
        Ok(())
    }

    /// Time left before the connection's own timeout.
    fn wait_time(&self) -> CommResult<Option<Duration>> {
        let ts = self.base.timeout_timestamp();
        if ts == NO_TIMEOUT {
            return Ok(None);
        }
        let left = ts - current_date_us();
        if left <= 0 {
            return Err(CommError::Timeout(self.base.name().to_string()));
        }
        // round up so a sub-millisecond remainder still waits
        Ok(Some(Duration::from_micros(left as u64 + 999)))
    }

    /// Read the single byte the last readiness wait announced. Returns
    /// whether it completed the line accumulated in `line`.
    fn read_byte(&mut self, line: &mut Vec<u8>) -> CommResult<bool> {
        let mut byte = [0u8; 1];
        loop {
            match self.stream.read(&mut byte) {
                Ok(0) => return Err(CommError::Hangup(self.base.name().to_string())),
                Ok(_) if byte[0] == b'\n' => return Ok(true),
                Ok(_) => {
                    line.push(byte[0]);
                    return Ok(false);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CommError::Io(e)),
            }
        }
    }
}
