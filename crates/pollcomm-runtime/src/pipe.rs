//! Pipe family
//!
//! A duplex socket pair created before `fork()`. The creating process
//! uses one end and its child the other; [`PipeEnd`] picks the right one
//! from the current pid, so the same value works on both sides of the
//! fork without any shared state.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::error::CommResult;
use crate::stream::{BufferConnection, MessageConnection, StreamConnection, Transport};

pub struct PipeEnd {
    creator_pid: u32,
    parent: Option<UnixStream>,
    child: Option<UnixStream>,
}

impl PipeEnd {
    /// Create the socket pair; both ends are non-blocking.
    pub fn new() -> CommResult<Self> {
        let (parent, child) = UnixStream::pair()?;
        parent.set_nonblocking(true)?;
        child.set_nonblocking(true)?;
        Ok(Self {
            creator_pid: std::process::id(),
            parent: Some(parent),
            child: Some(child),
        })
    }

    /// Whether the current process created the pipe.
    pub fn is_creator(&self) -> bool {
        std::process::id() == self.creator_pid
    }

    /// Close the end that belongs to the other process. Call right after
    /// `fork()` on both sides.
    pub fn forked(&mut self) {
        if self.is_creator() {
            self.child = None;
        } else {
            self.parent = None;
        }
    }

    /// Take the other end, e.g. to hand it to a thread instead of a child.
    pub fn take_peer(&mut self) -> Option<UnixStream> {
        if self.is_creator() {
            self.child.take()
        } else {
            self.parent.take()
        }
    }

    fn local(&mut self) -> Option<&mut UnixStream> {
        if self.is_creator() {
            self.parent.as_mut()
        } else {
            self.child.as_mut()
        }
    }

    fn not_open() -> io::Error {
        io::Error::from_raw_os_error(libc::EBADF)
    }
}

impl Transport for PipeEnd {
    fn fd(&self) -> Option<RawFd> {
        let end = if self.is_creator() { &self.parent } else { &self.child };
        end.as_ref().map(|s| s.as_raw_fd())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.local().ok_or_else(Self::not_open)?.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.local().ok_or_else(Self::not_open)?.write(buf)
    }

    fn close(&mut self) {
        self.parent = None;
        self.child = None;
    }
}

pub type PipeConnection<H> = StreamConnection<PipeEnd, H>;
pub type PipeBufferConnection<H> = BufferConnection<PipeEnd, H>;
pub type PipeMessageConnection<H> = MessageConnection<PipeEnd, H>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::Communicator;
    use crate::connection::Connection;
    use crate::stream::BufferCore;
    use pollcomm_core::config::CommConfig;
    use pollcomm_core::Message;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_creator_side_and_close() {
        let mut pipe = PipeEnd::new().unwrap();
        assert!(pipe.is_creator());
        assert!(pipe.fd().is_some());
        let peer = pipe.take_peer().unwrap();
        assert!(pipe.take_peer().is_none());
        drop(peer);
        pipe.close();
        pipe.close();
        assert!(pipe.fd().is_none());
    }

    #[test]
    fn test_message_pipe_round_trip() {
        let comm = Communicator::with_config(CommConfig::new());
        let mut pipe = PipeEnd::new().unwrap();
        let mut peer = pipe.take_peer().unwrap();
        peer.set_nonblocking(false).unwrap();

        let got = Rc::new(RefCell::new(Vec::new()));
        let g = got.clone();
        let conn = PipeMessageConnection::with_messages(
            pipe,
            move |core: &mut BufferCore<PipeEnd>, m: Message, _: &Communicator| {
                g.borrow_mut().push(m.get_parameter("n").unwrap_or("").to_string());
                if m.command() == "QUIT" {
                    let _ = core.send_message(&Message::new("BYE").unwrap());
                    core.mark_done();
                }
            },
        );
        let conn = comm.add(conn).unwrap();
        assert!(conn.borrow().valid_socket());

        peer.write_all(b"STEP n=1\nSTEP n=2\nQUIT n=3\n").unwrap();
        comm.run().unwrap();

        assert_eq!(*got.borrow(), vec!["1", "2", "3"]);
        let mut reply = [0u8; 4];
        peer.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"BYE\n");
    }
}
