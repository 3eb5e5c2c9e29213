//! Thread-done connection
//!
//! One-way wake-up from a worker thread to the reactor thread. The worker
//! keeps a [`ThreadDoneSignal`] and calls [`ThreadDoneSignal::signal`]
//! when it has finished; the reactor side reads the byte and runs its
//! handler.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use crate::communicator::Communicator;
use crate::connection::{Connection, ConnectionBase};
use crate::error::{CommError, CommResult};
use crate::fd;

/// Sending half. `Clone + Send`; the write end closes with the last clone.
#[derive(Debug, Clone)]
pub struct ThreadDoneSignal {
    write: Arc<OwnedFd>,
}

impl ThreadDoneSignal {
    /// Wake the reactor side once.
    pub fn signal(&self) -> CommResult<()> {
        loop {
            match fd::write_fd(self.write.as_raw_fd(), &[1u8]) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CommError::Io(e)),
            }
        }
    }
}

pub trait ThreadDoneHandler {
    fn on_thread_done(&mut self, base: &mut ConnectionBase, comm: &Communicator);
}

impl<F> ThreadDoneHandler for F
where
    F: FnMut(&mut ConnectionBase, &Communicator),
{
    fn on_thread_done(&mut self, base: &mut ConnectionBase, comm: &Communicator) {
        self(base, comm)
    }
}

pub struct ThreadDoneConnection<H> {
    base: ConnectionBase,
    read: Option<OwnedFd>,
    signal: ThreadDoneSignal,
    handler: H,
}

impl<H: ThreadDoneHandler> ThreadDoneConnection<H> {
    pub fn new(handler: H) -> CommResult<Self> {
        let (read, write) = fd::pipe()?;
        Ok(Self {
            base: ConnectionBase::new("thread done"),
            read: Some(read),
            signal: ThreadDoneSignal { write: Arc::new(write) },
            handler,
        })
    }

    /// Handle to give to the worker thread.
    pub fn signaler(&self) -> ThreadDoneSignal {
        self.signal.clone()
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn close(&mut self) {
        self.read = None;
    }
}

impl<H: ThreadDoneHandler> Connection for ThreadDoneConnection<H> {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ConnectionBase {
        &mut self.base
    }

    fn socket(&self) -> Option<RawFd> {
        self.read.as_ref().map(|fd| fd.as_raw_fd())
    }

    fn is_reader(&self) -> bool {
        true
    }

    fn on_read_ready(&mut self, comm: &Communicator) {
        let Some(read) = self.read.as_ref() else {
            return;
        };
        let mut byte = [0u8; 1];
        match fd::read_fd(read.as_raw_fd(), &mut byte) {
            Ok(1) => self.handler.on_thread_done(&mut self.base, comm),
            Ok(_) => self.on_hangup(comm),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                tracing::warn!(connection = %self.base.name(), error = %e, "thread done read failed");
                self.on_error(comm);
            }
        }
    }

    fn on_removed(&mut self, _comm: &Communicator) {
        self.close();
    }
}
