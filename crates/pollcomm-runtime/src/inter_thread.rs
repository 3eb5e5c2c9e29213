//! Inter-thread message connection
//!
//! Two threads exchange [`Message`]s through a pair of lock-free queues,
//! one per direction. Every queue has a semaphore eventfd holding one unit
//! per queued message, so the receiving side can wait on it with `poll`
//! or register it with its reactor.
//!
//! The creating thread is side A; any other thread is side B. `send`
//! always targets the other side.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use pollcomm_core::Message;

use crate::communicator::Communicator;
use crate::connection::{Connection, ConnectionBase};
use crate::error::CommResult;
use crate::fd::{self, EventFd};

const SIDE_A: usize = 0;
const SIDE_B: usize = 1;

#[derive(Debug)]
struct Shared {
    creator: ThreadId,
    events: [EventFd; 2],
    queues: [SegQueue<Message>; 2],
}

impl Shared {
    fn new() -> CommResult<Self> {
        Ok(Self {
            creator: thread::current().id(),
            events: [EventFd::create(true)?, EventFd::create(true)?],
            queues: [SegQueue::new(), SegQueue::new()],
        })
    }

    fn local_side(&self) -> usize {
        if thread::current().id() == self.creator {
            SIDE_A
        } else {
            SIDE_B
        }
    }

    fn send(&self, message: Message) -> CommResult<()> {
        let other = 1 - self.local_side();
        self.queues[other].push(message);
        self.events[other].notify(1)
    }

    /// Take one unit and its message from `side`, if any.
    fn take(&self, side: usize) -> CommResult<Option<Message>> {
        if self.events[side].take()?.is_none() {
            return Ok(None);
        }
        Ok(self.queues[side].pop())
    }
}

/// Side-specific message callbacks.
pub trait InterThreadHandler {
    /// A message arrived on the creating thread's side.
    fn process_message_a(&mut self, base: &mut ConnectionBase, message: Message, comm: &Communicator) {
        let _ = (base, comm);
        tracing::debug!(command = message.command(), "unhandled inter-thread message (side A)");
    }

    /// A message arrived on the other thread's side.
    fn process_message_b(&mut self, base: &mut ConnectionBase, message: Message, comm: &Communicator) {
        let _ = (base, comm);
        tracing::debug!(command = message.command(), "unhandled inter-thread message (side B)");
    }
}

/// Handle for the side that does not own the connection.
///
/// `Send`, so it can be moved into the other thread.
#[derive(Debug, Clone)]
pub struct InterThreadPeer {
    shared: Arc<Shared>,
}

impl InterThreadPeer {
    pub fn send(&self, message: Message) -> CommResult<()> {
        self.shared.send(message)
    }

    /// Wait up to `timeout` (`None` forever) for one message on this
    /// thread's side.
    pub fn poll(&self, timeout: Option<Duration>) -> CommResult<Option<Message>> {
        let side = self.shared.local_side();
        let event = &self.shared.events[side];
        if let Some(message) = self.shared.take(side)? {
            return Ok(Some(message));
        }
        match fd::poll_one(event.fd(), libc::POLLIN, timeout)? {
            Some(outcome) if outcome.readable => self.shared.take(side),
            _ => Ok(None),
        }
    }

    /// Turn this handle into a connection for a reactor on this thread.
    pub fn into_connection<H: InterThreadHandler>(self, handler: H) -> InterThreadConnection<H> {
        InterThreadConnection {
            base: ConnectionBase::new("inter-thread"),
            shared: self.shared,
            handler,
        }
    }
}

pub struct InterThreadConnection<H> {
    base: ConnectionBase,
    shared: Arc<Shared>,
    handler: H,
}

impl<H: InterThreadHandler> InterThreadConnection<H> {
    /// Create the pair; the calling thread becomes side A.
    pub fn new(handler: H) -> CommResult<Self> {
        Ok(Self {
            base: ConnectionBase::new("inter-thread"),
            shared: Arc::new(Shared::new()?),
            handler,
        })
    }

    /// Handle for the other thread.
    pub fn peer(&self) -> InterThreadPeer {
        InterThreadPeer {
            shared: self.shared.clone(),
        }
    }

    /// Queue `message` for the other side.
    pub fn send(&self, message: Message) -> CommResult<()> {
        self.shared.send(message)
    }

    /// Wait for one message without going through the reactor.
    pub fn poll(&self, timeout: Option<Duration>) -> CommResult<Option<Message>> {
        self.peer().poll(timeout)
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }
}

impl<H: InterThreadHandler> Connection for InterThreadConnection<H> {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ConnectionBase {
        &mut self.base
    }

    fn socket(&self) -> Option<RawFd> {
        Some(self.shared.events[self.shared.local_side()].fd())
    }

    fn is_reader(&self) -> bool {
        true
    }

    fn on_read_ready(&mut self, comm: &Communicator) {
        let side = self.shared.local_side();
        let message = match self.shared.take(side) {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(connection = %self.base.name(), error = %e, "inter-thread read failed");
                self.on_error(comm);
                return;
            }
        };
        if side == SIDE_A {
            self.handler.process_message_a(&mut self.base, message, comm);
        } else {
            self.handler.process_message_b(&mut self.base, message, comm);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pollcomm_core::config::CommConfig;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Collect(Rc<RefCell<Vec<String>>>);

    impl InterThreadHandler for Collect {
        fn process_message_a(&mut self, base: &mut ConnectionBase, message: Message, _comm: &Communicator) {
            self.0.borrow_mut().push(message.command().to_string());
            if message.command() == "BYE" {
                base.mark_done();
            }
        }
    }

    #[test]
    fn test_poll_takes_exactly_one() {
        let conn = InterThreadConnection::new(Collect(Rc::new(RefCell::new(Vec::new())))).unwrap();
        let peer = conn.peer();
        conn.send(Message::new("HELLO").unwrap()).unwrap();

        let got = std::thread::spawn(move || {
            let first = peer.poll(Some(Duration::from_millis(500))).unwrap();
            let second = peer.poll(Some(Duration::from_millis(20))).unwrap();
            (first, second)
        })
        .join()
        .unwrap();

        assert_eq!(got.0.map(|m| m.command().to_string()), Some("HELLO".to_string()));
        assert!(got.1.is_none());
    }

    #[test]
    fn test_reactor_side_receives_in_order() {
        let comm = Communicator::with_config(CommConfig::new());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let conn = InterThreadConnection::new(Collect(seen.clone())).unwrap();
        let peer = conn.peer();
        comm.add(conn).unwrap();

        let worker = std::thread::spawn(move || {
            for cmd in ["ONE", "TWO", "BYE"] {
                peer.send(Message::new(cmd).unwrap()).unwrap();
            }
        });
        comm.run().unwrap();
        worker.join().unwrap();
        assert_eq!(*seen.borrow(), vec!["ONE", "TWO", "BYE"]);
    }
}
