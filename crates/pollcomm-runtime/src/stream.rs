//! Byte-stream connection layers
//!
//! Pipes and TCP sockets share three layers, each generic over the
//! [`Transport`] that owns the descriptor:
//!
//! - [`StreamConnection`]: raw readiness callbacks handed to a
//!   [`StreamHandler`].
//! - [`BufferConnection`]: output queue with partial-write tracking, and
//!   input split into `\n`-terminated lines fed to a [`LineHandler`]
//!   under the per-pass event and time budget.
//! - [`MessageConnection`]: every line parsed into a [`Message`] for a
//!   [`MessageHandler`]. Malformed lines are logged and dropped.
//!
//! End of input is not treated as an event of its own; the reactor
//! reports it as a hangup (`POLLHUP` / `POLLRDHUP`).

use std::io;
use std::os::fd::RawFd;

use pollcomm_core::time::{current_date_us, NO_TIMEOUT};
use pollcomm_core::Message;

use crate::communicator::Communicator;
use crate::connection::{Connection, ConnectionBase};
use crate::error::{CommError, CommResult};

/// Owner of a non-blocking byte-stream descriptor.
///
/// `close` must be idempotent; after it, `fd()` returns `None`.
pub trait Transport {
    fn fd(&self) -> Option<RawFd>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn close(&mut self);
}

/// Why a stream stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Error,
    Hangup,
    Invalid,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CloseReason::Error => "error",
            CloseReason::Hangup => "hangup",
            CloseReason::Invalid => "invalid",
        })
    }
}

/// Reply path handed to message handlers.
pub trait MessageSender {
    fn send_message(&mut self, message: &Message) -> CommResult<()>;

    /// Finish once everything sent so far is written.
    fn mark_done(&mut self);
}

// ---------------------------------------------------------------------------
// Raw layer
// ---------------------------------------------------------------------------

pub trait StreamHandler<T> {
    fn on_readable(&mut self, base: &mut ConnectionBase, transport: &mut T, comm: &Communicator);

    fn on_writable(&mut self, _base: &mut ConnectionBase, _transport: &mut T, _comm: &Communicator) {}

    /// Ask the reactor for write readiness.
    fn wants_write(&self) -> bool {
        false
    }

    /// The stream is about to be closed and removed.
    fn on_closed(&mut self, _base: &mut ConnectionBase, _transport: &mut T, _reason: CloseReason, _comm: &Communicator) {}
}

/// Raw duplex stream: readiness goes straight to the handler.
pub struct StreamConnection<T, H> {
    base: ConnectionBase,
    transport: T,
    handler: H,
}

impl<T: Transport, H: StreamHandler<T>> StreamConnection<T, H> {
    pub fn new(transport: T, handler: H) -> Self {
        Self::with_base(ConnectionBase::new("stream"), transport, handler)
    }

    pub fn with_base(base: ConnectionBase, transport: T, handler: H) -> Self {
        Self { base, transport, handler }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn close(&mut self) {
        self.transport.close();
    }

    fn closed(&mut self, reason: CloseReason, comm: &Communicator) {
        tracing::debug!(connection = %self.base.name(), %reason, "stream closed");
        self.handler.on_closed(&mut self.base, &mut self.transport, reason, comm);
        self.transport.close();
        comm.remove_connection(self.base.id());
    }
}

impl<T: Transport, H: StreamHandler<T>> Connection for StreamConnection<T, H> {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ConnectionBase {
        &mut self.base
    }

    fn socket(&self) -> Option<RawFd> {
        self.transport.fd()
    }

    fn is_reader(&self) -> bool {
        true
    }

    fn is_writer(&self) -> bool {
        self.handler.wants_write()
    }

    fn on_read_ready(&mut self, comm: &Communicator) {
        self.handler.on_readable(&mut self.base, &mut self.transport, comm);
    }

    fn on_write_ready(&mut self, comm: &Communicator) {
        self.handler.on_writable(&mut self.base, &mut self.transport, comm);
    }

    fn on_error(&mut self, comm: &Communicator) {
        self.closed(CloseReason::Error, comm);
    }

    fn on_hangup(&mut self, comm: &Communicator) {
        self.closed(CloseReason::Hangup, comm);
    }

    fn on_invalid(&mut self, comm: &Communicator) {
        self.closed(CloseReason::Invalid, comm);
    }

    fn on_removed(&mut self, _comm: &Communicator) {
        self.transport.close();
    }
}

// ---------------------------------------------------------------------------
// Buffer layer
// ---------------------------------------------------------------------------

/// State of a buffered stream, handed to line/message handlers.
pub struct BufferCore<T> {
    base: ConnectionBase,
    transport: T,
    output: Vec<u8>,
    position: usize,
    input: Vec<u8>,
    read_chunk: usize,
    pending_lines: bool,
    socket_error: bool,
    error_reported: bool,
    drained: bool,
}

impl<T: Transport> BufferCore<T> {
    fn new(base: ConnectionBase, transport: T) -> Self {
        Self {
            base,
            transport,
            output: Vec::new(),
            position: 0,
            input: Vec::new(),
            read_chunk: pollcomm_core::defaults::READ_CHUNK_SIZE,
            pending_lines: false,
            socket_error: false,
            error_reported: false,
            drained: false,
        }
    }

    pub fn base(&self) -> &ConnectionBase {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut ConnectionBase {
        &mut self.base
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Queue bytes and write as much as the descriptor takes right now.
    pub fn write(&mut self, data: &[u8]) -> CommResult<()> {
        if self.socket_error {
            return Err(CommError::SocketError(self.base.name().to_string()));
        }
        if self.transport.fd().is_none() {
            return Err(CommError::InvalidSocket(self.base.name().to_string()));
        }
        self.output.extend_from_slice(data);
        self.flush()
    }

    /// Serialize `message` and queue it with its trailing newline.
    pub fn send_message(&mut self, message: &Message) -> CommResult<()> {
        let mut text = message.to_message()?;
        text.push('\n');
        self.write(text.as_bytes())
    }

    /// Bytes queued and not yet written.
    pub fn pending_output(&self) -> usize {
        self.output.len() - self.position
    }

    /// Bytes received that do not form a complete line yet.
    pub fn partial_input(&self) -> &[u8] {
        &self.input
    }

    /// Remove the connection once all queued output is written.
    pub fn mark_done(&mut self) {
        self.base.mark_done();
    }

    pub fn has_socket_error(&self) -> bool {
        self.socket_error
    }

    /// Close the descriptor and drop queued output. Idempotent.
    pub fn close(&mut self) {
        self.transport.close();
        self.output.clear();
        self.position = 0;
    }

    pub fn set_read_chunk_size(&mut self, size: usize) {
        self.read_chunk = size.max(1);
    }

    fn flush(&mut self) -> CommResult<()> {
        while self.position < self.output.len() {
            match self.transport.write(&self.output[self.position..]) {
                Ok(0) => break,
                Ok(n) => self.position += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(connection = %self.base.name(), error = %e, "write failed");
                    self.socket_error = true;
                    return Err(CommError::Io(e));
                }
            }
        }
        if self.position > 0 && self.position == self.output.len() {
            self.output.clear();
            self.position = 0;
            self.drained = true;
        }
        Ok(())
    }

    /// Read everything available. Returns whether the descriptor failed.
    fn fill(&mut self) -> bool {
        let mut chunk = vec![0u8; self.read_chunk];
        loop {
            match self.transport.read(&mut chunk) {
                Ok(0) => return false,
                Ok(n) => {
                    self.input.extend_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        return false;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(connection = %self.base.name(), error = %e, "read failed");
                    self.socket_error = true;
                    return true;
                }
            }
        }
    }

    /// Pop the next complete line, without its `\n`.
    fn next_line(&mut self, scan_from: &mut usize) -> Option<String> {
        let start = *scan_from;
        let offset = self.input[start..].iter().position(|&b| b == b'\n')?;
        let line = String::from_utf8_lossy(&self.input[start..start + offset]).into_owned();
        *scan_from = start + offset + 1;
        Some(line)
    }
}

impl<T: Transport> MessageSender for BufferCore<T> {
    fn send_message(&mut self, message: &Message) -> CommResult<()> {
        BufferCore::send_message(self, message)
    }

    fn mark_done(&mut self) {
        BufferCore::mark_done(self);
    }
}

pub trait LineHandler<T> {
    fn process_line(&mut self, core: &mut BufferCore<T>, line: &str, comm: &Communicator);

    /// All queued output was written; runs before the default removal of
    /// a done connection.
    fn on_output_drained(&mut self, _core: &mut BufferCore<T>, _comm: &Communicator) {}

    /// The stream failed or the peer left; the connection is removed next.
    fn on_closed(&mut self, _core: &mut BufferCore<T>, _reason: CloseReason, _comm: &Communicator) {}

    fn on_removed(&mut self, _core: &mut BufferCore<T>, _comm: &Communicator) {}
}

impl<T, F> LineHandler<T> for F
where
    F: FnMut(&mut BufferCore<T>, &str, &Communicator),
{
    fn process_line(&mut self, core: &mut BufferCore<T>, line: &str, comm: &Communicator) {
        self(core, line, comm)
    }
}

/// Line-oriented stream.
pub struct BufferConnection<T, H> {
    core: BufferCore<T>,
    handler: H,
}

impl<T: Transport, H: LineHandler<T>> BufferConnection<T, H> {
    pub fn new(transport: T, handler: H) -> Self {
        Self::with_base(ConnectionBase::new("buffer"), transport, handler)
    }

    pub fn with_base(base: ConnectionBase, transport: T, handler: H) -> Self {
        Self {
            core: BufferCore::new(base, transport),
            handler,
        }
    }

    pub fn core(&self) -> &BufferCore<T> {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut BufferCore<T> {
        &mut self.core
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn write(&mut self, data: &[u8]) -> CommResult<()> {
        self.core.write(data)
    }

    pub fn send_message(&mut self, message: &Message) -> CommResult<()> {
        self.core.send_message(message)
    }

    pub fn close(&mut self) {
        self.core.close();
    }

    /// Handle buffered lines within this pass's budget.
    fn process_lines(&mut self, comm: &Communicator) {
        let limit = self.core.base.event_limit();
        let time_limit = self.core.base.processing_time_limit();
        self.handle_lines(limit, time_limit, comm);
    }

    fn handle_lines(&mut self, limit: i64, time_limit: i64, comm: &Communicator) {
        let id = self.core.base.id();
        let start = current_date_us();
        let registered = comm.contains(id);

        let mut scan_from = 0;
        let mut handled = 0;
        while handled < limit {
            if self.core.base.is_done() || self.core.transport.fd().is_none() {
                break;
            }
            if registered && !comm.contains(id) {
                break;
            }
            if time_limit != NO_TIMEOUT && handled > 0 && current_date_us() - start >= time_limit {
                tracing::trace!(connection = %self.core.base.name(), handled, "processing time limit reached");
                break;
            }
            let Some(line) = self.core.next_line(&mut scan_from) else {
                break;
            };
            self.handler.process_line(&mut self.core, &line, comm);
            handled += 1;
        }
        self.core.input.drain(..scan_from);
        self.core.pending_lines = self.core.input.contains(&b'\n');
    }

    /// Report drains and write failures that happened during a callback.
    fn settle(&mut self, comm: &Communicator) {
        if self.core.socket_error && !self.core.error_reported {
            self.core.error_reported = true;
            self.on_error(comm);
            return;
        }
        if std::mem::take(&mut self.core.drained) {
            self.on_output_drained(comm);
        }
    }

    fn closed(&mut self, reason: CloseReason, comm: &Communicator) {
        if reason == CloseReason::Hangup && self.core.transport.fd().is_some() && !self.core.socket_error {
            // the peer is gone: whatever complete lines it sent are handled now
            self.core.fill();
            self.handle_lines(i64::MAX, NO_TIMEOUT, comm);
        }
        tracing::debug!(connection = %self.core.base.name(), %reason, "buffered stream closed");
        self.handler.on_closed(&mut self.core, reason, comm);
        self.core.close();
        comm.remove_connection(self.core.base.id());
    }
}

impl<T: Transport, H: LineHandler<T>> Connection for BufferConnection<T, H> {
    fn base(&self) -> &ConnectionBase {
        &self.core.base
    }

    fn base_mut(&mut self) -> &mut ConnectionBase {
        &mut self.core.base
    }

    fn socket(&self) -> Option<RawFd> {
        self.core.transport.fd()
    }

    fn is_reader(&self) -> bool {
        true
    }

    fn is_writer(&self) -> bool {
        self.core.pending_output() > 0
    }

    fn has_pending_input(&self) -> bool {
        self.core.pending_lines
    }

    fn has_socket_error(&self) -> bool {
        self.core.socket_error
    }

    fn on_read_ready(&mut self, comm: &Communicator) {
        if self.core.transport.fd().is_none() {
            return;
        }
        if self.core.fill() {
            self.settle(comm);
            return;
        }
        self.process_lines(comm);
        self.settle(comm);
    }

    fn on_write_ready(&mut self, comm: &Communicator) {
        // errors are recorded in the core and reported by settle
        let _ = self.core.flush();
        self.settle(comm);
    }

    fn on_output_drained(&mut self, comm: &Communicator) {
        self.handler.on_output_drained(&mut self.core, comm);
        if self.core.base.is_done() && !self.core.socket_error {
            comm.remove_connection(self.core.base.id());
        }
    }

    fn on_error(&mut self, comm: &Communicator) {
        self.closed(CloseReason::Error, comm);
    }

    fn on_hangup(&mut self, comm: &Communicator) {
        self.closed(CloseReason::Hangup, comm);
    }

    fn on_invalid(&mut self, comm: &Communicator) {
        self.closed(CloseReason::Invalid, comm);
    }

    fn on_added(&mut self, comm: &Communicator) {
        self.core.set_read_chunk_size(comm.config().read_chunk_size);
    }

    fn on_removed(&mut self, comm: &Communicator) {
        self.handler.on_removed(&mut self.core, comm);
        self.core.close();
    }
}

// ---------------------------------------------------------------------------
// Message layer
// ---------------------------------------------------------------------------

pub trait MessageHandler<T> {
    fn process_message(&mut self, core: &mut BufferCore<T>, message: Message, comm: &Communicator);

    fn on_output_drained(&mut self, _core: &mut BufferCore<T>, _comm: &Communicator) {}

    fn on_closed(&mut self, _core: &mut BufferCore<T>, _reason: CloseReason, _comm: &Communicator) {}

    fn on_removed(&mut self, _core: &mut BufferCore<T>, _comm: &Communicator) {}
}

impl<T, F> MessageHandler<T> for F
where
    F: FnMut(&mut BufferCore<T>, Message, &Communicator),
{
    fn process_message(&mut self, core: &mut BufferCore<T>, message: Message, comm: &Communicator) {
        self(core, message, comm)
    }
}

/// Adapter parsing each line before handing it to a [`MessageHandler`].
pub struct MessageLines<H>(pub H);

impl<T, H: MessageHandler<T>> LineHandler<T> for MessageLines<H> {
    fn process_line(&mut self, core: &mut BufferCore<T>, line: &str, comm: &Communicator) {
        match Message::parse(line) {
            Ok(message) => self.0.process_message(core, message, comm),
            Err(e) => {
                tracing::warn!(connection = %core.base.name(), error = %e, line, "dropping malformed message");
            }
        }
    }

    fn on_output_drained(&mut self, core: &mut BufferCore<T>, comm: &Communicator) {
        self.0.on_output_drained(core, comm);
    }

    fn on_closed(&mut self, core: &mut BufferCore<T>, reason: CloseReason, comm: &Communicator) {
        self.0.on_closed(core, reason, comm);
    }

    fn on_removed(&mut self, core: &mut BufferCore<T>, comm: &Communicator) {
        self.0.on_removed(core, comm);
    }
}

/// Message-oriented stream.
pub type MessageConnection<T, H> = BufferConnection<T, MessageLines<H>>;

impl<T: Transport, H: MessageHandler<T>> BufferConnection<T, MessageLines<H>> {
    pub fn with_messages(transport: T, handler: H) -> Self {
        Self::with_base(ConnectionBase::new("messages"), transport, MessageLines(handler))
    }

    pub fn message_handler(&self) -> &H {
        &self.handler.0
    }

    pub fn message_handler_mut(&mut self) -> &mut H {
        &mut self.handler.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pollcomm_core::config::CommConfig;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// In-memory transport: reads from a script, records writes.
    struct Scripted {
        fd: Option<RawFd>,
        incoming: VecDeque<u8>,
        written: Rc<RefCell<Vec<u8>>>,
        accept: usize,
    }

    impl Scripted {
        fn new(incoming: &[u8]) -> Self {
            Self {
                fd: Some(0),
                incoming: incoming.iter().copied().collect(),
                written: Rc::new(RefCell::new(Vec::new())),
                accept: usize::MAX,
            }
        }
    }

    impl Transport for Scripted {
        fn fd(&self) -> Option<RawFd> {
            self.fd
        }
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.incoming.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.incoming.len());
            for (slot, byte) in buf.iter_mut().zip(self.incoming.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.accept == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.accept);
            self.accept -= n;
            self.written.borrow_mut().extend_from_slice(&buf[..n]);
            Ok(n)
        }
        fn close(&mut self) {
            self.fd = None;
        }
    }

    fn comm() -> Communicator {
        Communicator::with_config(CommConfig::new())
    }

    #[test]
    fn test_lines_respect_event_limit() {
        let comm = comm();
        let lines = Rc::new(RefCell::new(Vec::new()));
        let seen = lines.clone();
        let mut conn = BufferConnection::new(
            Scripted::new(b"one\ntwo\nthree\npart"),
            move |_: &mut BufferCore<Scripted>, line: &str, _: &Communicator| {
                seen.borrow_mut().push(line.to_string());
            },
        );
        conn.base_mut().set_event_limit(2).unwrap();

        conn.on_read_ready(&comm);
        assert_eq!(*lines.borrow(), vec!["one", "two"]);
        assert!(conn.has_pending_input());

        conn.on_read_ready(&comm);
        assert_eq!(*lines.borrow(), vec!["one", "two", "three"]);
        assert!(!conn.has_pending_input());
        assert_eq!(conn.core().partial_input(), b"part");
    }

    #[test]
    fn test_time_limit_caps_a_pass() {
        let comm = comm();
        let lines = Rc::new(RefCell::new(Vec::new()));
        let seen = lines.clone();
        let mut conn = BufferConnection::new(
            Scripted::new(b"a\nb\nc\n"),
            move |_: &mut BufferCore<Scripted>, line: &str, _: &Communicator| {
                std::thread::sleep(std::time::Duration::from_millis(15));
                seen.borrow_mut().push(line.to_string());
            },
        );
        conn.base_mut().set_event_limit(100).unwrap();
        conn.base_mut().set_processing_time_limit(10_000).unwrap();

        conn.on_read_ready(&comm);
        assert_eq!(*lines.borrow(), vec!["a"]);
        assert!(conn.has_pending_input());

        conn.on_read_ready(&comm);
        assert_eq!(*lines.borrow(), vec!["a", "b"]);
        conn.on_read_ready(&comm);
        assert_eq!(*lines.borrow(), vec!["a", "b", "c"]);
        assert!(!conn.has_pending_input());
    }

    #[test]
    fn test_hangup_handles_buffered_lines() {
        let comm = comm();
        let steps = Rc::new(RefCell::new(Vec::new()));
        let seen = steps.clone();
        let mut script = Vec::new();
        for i in 1..=8 {
            script.extend_from_slice(format!("STEP n={}\n", i).as_bytes());
        }
        script.extend_from_slice(b"STEP n=9");
        let mut conn = MessageConnection::with_messages(
            Scripted::new(&script),
            move |_: &mut BufferCore<Scripted>, m: Message, _: &Communicator| {
                seen.borrow_mut().push(m.get_integer_parameter("n").unwrap());
            },
        );

        conn.on_read_ready(&comm);
        assert_eq!(*steps.borrow(), vec![1, 2, 3, 4, 5]);

        conn.on_hangup(&comm);
        // the unterminated tail is not a message
        assert_eq!(*steps.borrow(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(conn.socket().is_none());
    }

    #[test]
    fn test_partial_write_tracks_position() {
        let comm = comm();
        let mut transport = Scripted::new(b"");
        transport.accept = 3;
        let written = transport.written.clone();
        let mut conn = BufferConnection::new(transport, |_: &mut BufferCore<Scripted>, _: &str, _: &Communicator| {});

        conn.write(b"hello").unwrap();
        assert_eq!(conn.core().pending_output(), 2);
        assert!(conn.is_writer());

        conn.core_mut().transport_mut().accept = usize::MAX;
        conn.on_write_ready(&comm);
        assert_eq!(conn.core().pending_output(), 0);
        assert!(!conn.is_writer());
        assert_eq!(&*written.borrow(), b"hello");
    }

    #[test]
    fn test_malformed_message_is_dropped() {
        let comm = comm();
        let got = Rc::new(RefCell::new(Vec::new()));
        let g = got.clone();
        let mut conn = MessageConnection::with_messages(
            Scripted::new(b"PING a=1\nsvc/CMD a=1;3\nPONG\n"),
            move |_: &mut BufferCore<Scripted>, m: Message, _: &Communicator| {
                g.borrow_mut().push(m.command().to_string());
            },
        );
        conn.on_read_ready(&comm);
        assert_eq!(*got.borrow(), vec!["PING", "PONG"]);
    }

    #[test]
    fn test_reply_appends_newline() {
        let comm = comm();
        let transport = Scripted::new(b"PING\n");
        let written = transport.written.clone();
        let mut conn = MessageConnection::with_messages(
            transport,
            |core: &mut BufferCore<Scripted>, m: Message, _: &Communicator| {
                let mut reply = Message::new("PONG").unwrap();
                reply.reply_to(&m);
                core.send_message(&reply).unwrap();
            },
        );
        conn.on_read_ready(&comm);
        assert_eq!(&*written.borrow(), b"PONG\n");
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut conn = BufferConnection::new(
            Scripted::new(b""),
            |_: &mut BufferCore<Scripted>, _: &str, _: &Communicator| {},
        );
        conn.close();
        conn.close();
        assert!(conn.socket().is_none());
        assert!(matches!(conn.write(b"x"), Err(CommError::InvalidSocket(_))));
    }
}
