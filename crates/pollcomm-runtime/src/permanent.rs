//! Permanent reconnecting client
//!
//! A timer-driven connection that keeps a message link to `addr:port`
//! alive until [`PermanentConnection::mark_done`] is called.
//!
//! ```text
//! Disconnected --timeout--> Connecting --ok--> Connected
//!      ^                        |                  |
//!      +-------- failed --------+                  |
//!      +------------ error / hangup / invalid -----+
//! any state --mark_done--> Done
//! ```
//!
//! The connect attempt runs either inline (blocking the reactor) or on a
//! background thread. The worker only connects: its result comes back
//! through a mutex-guarded slot plus a thread-done wake-up, tagged with an
//! attempt generation so a result arriving after `mark_done` or
//! `disconnect` is dropped.
//!
//! Messages sent with `cache = true` while not connected are queued and
//! written as soon as the link is up.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::TcpStream;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use parking_lot::Mutex;
use pollcomm_core::time::{current_date_us, duration_to_us, NO_TIMEOUT};
use pollcomm_core::Message;

use crate::communicator::Communicator;
use crate::connection::{Connection, ConnectionBase, ConnectionId};
use crate::error::{CommError, CommResult};
use crate::stream::{BufferCore, CloseReason, MessageConnection, MessageHandler, MessageLines, MessageSender};
use crate::tcp::TcpServerClient;
use crate::thread_done::{ThreadDoneConnection, ThreadDoneHandler, ThreadDoneSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentState {
    Disconnected,
    Connecting,
    Connected,
    Done,
}

impl std::fmt::Display for PermanentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PermanentState::Disconnected => "disconnected",
            PermanentState::Connecting => "connecting",
            PermanentState::Connected => "connected",
            PermanentState::Done => "done",
        })
    }
}

/// Callbacks of a permanent client.
///
/// Handlers reply through `link`. They must not call back into the
/// [`PermanentConnection`] handle itself.
pub trait PermanentHandler {
    fn process_message(&mut self, link: &mut dyn MessageSender, message: Message, comm: &Communicator);

    /// The link is up; cached messages were already queued.
    fn process_connected(&mut self, _link: &mut dyn MessageSender, _comm: &Communicator) {}

    /// A connect attempt failed; the next one is scheduled.
    fn process_connection_failed(&mut self, _error: &str, _comm: &Communicator) {}

    /// An established link went away; the next attempt is scheduled.
    fn process_disconnected(&mut self, _comm: &Communicator) {}

    fn on_state_change(&mut self, _from: PermanentState, _to: PermanentState) {}
}

impl<F> PermanentHandler for F
where
    F: FnMut(&mut dyn MessageSender, Message, &Communicator),
{
    fn process_message(&mut self, link: &mut dyn MessageSender, message: Message, comm: &Communicator) {
        self(link, message, comm)
    }
}

type AttemptResult = Result<TcpStream, String>;
type Messenger<H> = MessageConnection<TcpServerClient, Relay<H>>;

struct LinkState<H> {
    state: PermanentState,
    cache: VecDeque<Message>,
    messenger: Option<Rc<RefCell<Messenger<H>>>>,
    messenger_id: Option<ConnectionId>,
    generation: u64,
    in_flight: bool,
    slot: Arc<Mutex<Option<(u64, AttemptResult)>>>,
    signal: Option<ThreadDoneSignal>,
    thread_done: Option<ConnectionId>,
    timer: Weak<RefCell<PermanentConnection<H>>>,
    addr: String,
    port: u16,
    pause_us: i64,
}

impl<H: PermanentHandler> LinkState<H> {
    fn set_state(&mut self, handler: &Rc<RefCell<H>>, to: PermanentState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        tracing::debug!(addr = %self.addr, port = self.port, %from, %to, "permanent state change");
        if let Ok(mut h) = handler.try_borrow_mut() {
            h.on_state_change(from, to);
        }
    }

    /// Run `f` on the timer's base: `own` when called from the timer
    /// itself, otherwise through the weak handle.
    fn with_timer(&self, own: Option<&mut ConnectionBase>, f: impl FnOnce(&mut ConnectionBase)) {
        match own {
            Some(base) => f(base),
            None => {
                let Some(timer) = self.timer.upgrade() else {
                    return;
                };
                match timer.try_borrow_mut() {
                    Ok(mut t) => f(&mut t.base),
                    Err(_) => tracing::debug!(addr = %self.addr, "timer busy, schedule left to the caller"),
                };
            }
        }
    }

    /// Schedule the next attempt `|pause|` from now.
    fn rearm(&self, own: Option<&mut ConnectionBase>) {
        let at = current_date_us() + self.pause_us.abs();
        self.with_timer(own, |base| {
            base.set_enabled(true);
            // `at` is a valid date, the setter cannot fail
            let _ = base.set_timeout_date(at);
        });
    }
}

/// Relays messenger events to the shared handler and state.
struct Relay<H> {
    link: Weak<RefCell<LinkState<H>>>,
    handler: Rc<RefCell<H>>,
}

impl<H: PermanentHandler> MessageHandler<TcpServerClient> for Relay<H> {
    fn process_message(&mut self, core: &mut BufferCore<TcpServerClient>, message: Message, comm: &Communicator) {
        match self.handler.try_borrow_mut() {
            Ok(mut h) => h.process_message(core, message, comm),
            Err(_) => tracing::warn!(command = message.command(), "permanent handler busy, message dropped"),
        }
    }

    fn on_closed(&mut self, core: &mut BufferCore<TcpServerClient>, reason: CloseReason, _comm: &Communicator) {
        tracing::info!(peer = %core.transport().client_addr_port(), %reason, "permanent link lost");
    }

    fn on_removed(&mut self, _core: &mut BufferCore<TcpServerClient>, comm: &Communicator) {
        let Some(link_rc) = self.link.upgrade() else {
            return;
        };
        let lost = {
            let Ok(mut link) = link_rc.try_borrow_mut() else {
                return;
            };
            link.messenger = None;
            link.messenger_id = None;
            if link.state == PermanentState::Connected {
                link.set_state(&self.handler, PermanentState::Disconnected);
                link.rearm(None);
                true
            } else {
                false
            }
        };
        if lost {
            if let Ok(mut h) = self.handler.try_borrow_mut() {
                h.process_disconnected(comm);
            }
        }
    }
}

/// Collects background connect results.
struct AttemptDone<H> {
    link: Weak<RefCell<LinkState<H>>>,
    handler: Rc<RefCell<H>>,
}

impl<H: PermanentHandler + 'static> ThreadDoneHandler for AttemptDone<H> {
    fn on_thread_done(&mut self, _base: &mut ConnectionBase, comm: &Communicator) {
        let Some(link_rc) = self.link.upgrade() else {
            return;
        };
        let (generation, result) = {
            let mut link = link_rc.borrow_mut();
            let taken = link.slot.lock().take();
            let Some(taken) = taken else {
                return;
            };
            link.in_flight = false;
            if taken.0 != link.generation || link.state != PermanentState::Connecting {
                tracing::debug!(generation = taken.0, "dropping stale connect result");
                if link.state == PermanentState::Disconnected {
                    link.rearm(None);
                }
                return;
            }
            taken
        };
        tracing::trace!(generation, "connect result received");
        match result {
            Ok(stream) => connected(&link_rc, &self.handler, stream, comm, None),
            Err(error) => failed(&link_rc, &self.handler, error, comm, None),
        }
    }
}

fn connected<H: PermanentHandler + 'static>(
    link_rc: &Rc<RefCell<LinkState<H>>>,
    handler: &Rc<RefCell<H>>,
    stream: TcpStream,
    comm: &Communicator,
    mut own: Option<&mut ConnectionBase>,
) {
    let client = match TcpServerClient::new(stream) {
        Ok(client) => client,
        Err(e) => return failed(link_rc, handler, e.to_string(), comm, own),
    };
    let peer = client.client_addr_port();
    let relay = Relay {
        link: Rc::downgrade(link_rc),
        handler: handler.clone(),
    };
    let mut messenger = Messenger::with_base(
        ConnectionBase::with_config(format!("permanent {}", peer), comm.config()),
        client,
        MessageLines(relay),
    );

    {
        let mut link = link_rc.borrow_mut();
        link.set_state(handler, PermanentState::Connected);
        while let Some(message) = link.cache.pop_front() {
            if let Err(e) = messenger.send_message(&message) {
                tracing::warn!(%peer, error = %e, "cached message not sent");
            }
        }
        link.with_timer(own.as_deref_mut(), |base| base.set_enabled(false));
    }
    tracing::info!(%peer, "permanent link established");

    if let Ok(mut h) = handler.try_borrow_mut() {
        h.process_connected(messenger.core_mut(), comm);
    }

    let id = messenger.base().id();
    match comm.add(messenger) {
        Ok(messenger) => {
            let mut link = link_rc.borrow_mut();
            link.messenger = Some(messenger);
            link.messenger_id = Some(id);
        }
        Err(e) => {
            tracing::warn!(%peer, error = %e, "cannot register permanent link");
            let mut link = link_rc.borrow_mut();
            link.set_state(handler, PermanentState::Disconnected);
            link.rearm(own);
        }
    }
}

fn failed<H: PermanentHandler>(
    link_rc: &Rc<RefCell<LinkState<H>>>,
    handler: &Rc<RefCell<H>>,
    error: String,
    comm: &Communicator,
    own: Option<&mut ConnectionBase>,
) {
    {
        let mut link = link_rc.borrow_mut();
        if link.state == PermanentState::Done {
            return;
        }
        tracing::info!(addr = %link.addr, port = link.port, %error, "permanent connect attempt failed");
        link.set_state(handler, PermanentState::Disconnected);
        link.rearm(own);
    }
    if let Ok(mut h) = handler.try_borrow_mut() {
        h.process_connection_failed(&error, comm);
    }
}

/// The timer side of a permanent client; this is what gets registered.
pub struct PermanentConnection<H> {
    base: ConnectionBase,
    link: Rc<RefCell<LinkState<H>>>,
    handler: Rc<RefCell<H>>,
    pause_us: Option<i64>,
    use_thread: bool,
}

impl<H: PermanentHandler + 'static> PermanentConnection<H> {
    /// Create a client for `addr:port`.
    ///
    /// Defaults: pause from the reactor config, attempts on a background
    /// thread. Register the returned handle with `add_connection`.
    pub fn new(addr: &str, port: u16, handler: H) -> Rc<RefCell<Self>> {
        let addr = addr.to_string();
        Rc::new_cyclic(|timer| {
            RefCell::new(Self {
                base: ConnectionBase::new(format!("permanent {}:{}", addr, port)),
                link: Rc::new(RefCell::new(LinkState {
                    state: PermanentState::Disconnected,
                    cache: VecDeque::new(),
                    messenger: None,
                    messenger_id: None,
                    generation: 0,
                    in_flight: false,
                    slot: Arc::new(Mutex::new(None)),
                    signal: None,
                    thread_done: None,
                    timer: timer.clone(),
                    addr,
                    port,
                    pause_us: 0,
                })),
                handler: Rc::new(RefCell::new(handler)),
                pause_us: None,
                use_thread: true,
            })
        })
    }

    /// Microseconds between attempts. Negative: first attempt right away,
    /// then `|pause|` between attempts. Takes effect when added.
    pub fn set_pause(&mut self, pause_us: i64) {
        self.pause_us = Some(pause_us);
    }

    /// Connect on a background thread (default) or inline.
    pub fn set_use_thread(&mut self, use_thread: bool) {
        self.use_thread = use_thread;
    }

    pub fn state(&self) -> PermanentState {
        self.link.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == PermanentState::Connected
    }

    /// Number of messages waiting for the link.
    pub fn cache_size(&self) -> usize {
        self.link.borrow().cache.len()
    }

    /// Shared handle to the callbacks. Do not hold a borrow across `run`.
    pub fn handler(&self) -> Rc<RefCell<H>> {
        self.handler.clone()
    }

    /// Peer address of the live link, if any.
    pub fn client_addr_port(&self) -> Option<String> {
        let link = self.link.borrow();
        let messenger = link.messenger.as_ref()?;
        let messenger = messenger.try_borrow().ok()?;
        Some(messenger.core().transport().client_addr_port())
    }

    /// Send now if connected, otherwise queue when `cache` is set.
    pub fn send(&self, message: &Message, cache: bool) -> CommResult<()> {
        let mut link = self.link.borrow_mut();
        match link.state {
            PermanentState::Connected => {
                let messenger = link
                    .messenger
                    .as_ref()
                    .ok_or_else(|| CommError::InvalidSocket(self.base.name().to_string()))?;
                let mut messenger = messenger
                    .try_borrow_mut()
                    .map_err(|_| CommError::InvalidConnection(self.base.name().to_string()))?;
                messenger.send_message(message)
            }
            PermanentState::Disconnected | PermanentState::Connecting if cache => {
                link.cache.push_back(message.clone());
                Ok(())
            }
            _ => Err(CommError::InvalidSocket(self.base.name().to_string())),
        }
    }

    /// Stop reconnecting. Queued output on a live link is flushed first.
    pub fn mark_done(&mut self) {
        let mut link = self.link.borrow_mut();
        link.set_state(&self.handler, PermanentState::Done);
        link.cache.clear();
        if let Some(messenger) = &link.messenger {
            if let Ok(mut m) = messenger.try_borrow_mut() {
                m.core_mut().mark_done();
            }
        }
        self.base.set_enabled(true);
        self.base.mark_done();
    }

    /// Drop the live link (or abandon the attempt in flight) and schedule
    /// a new attempt.
    pub fn disconnect(&mut self, comm: &Communicator) {
        let messenger = {
            let mut link = self.link.borrow_mut();
            if link.state == PermanentState::Done {
                return;
            }
            link.generation += 1;
            link.messenger = None;
            link.messenger_id.take()
        };
        if let Some(id) = messenger {
            comm.remove_connection(id);
        }
        let lost = {
            let mut link = self.link.borrow_mut();
            let lost = link.state == PermanentState::Connected;
            link.set_state(&self.handler, PermanentState::Disconnected);
            link.rearm(Some(&mut self.base));
            lost
        };
        if lost {
            if let Ok(mut h) = self.handler.try_borrow_mut() {
                h.process_disconnected(comm);
            }
        }
    }

    fn attempt(&mut self, comm: &Communicator) {
        let mut link = self.link.borrow_mut();
        if link.state != PermanentState::Disconnected {
            return;
        }
        if link.in_flight {
            // the abandoned attempt re-arms the timer when it reports back
            tracing::info!(addr = %link.addr, "connect attempt already in flight");
            return;
        }
        link.set_state(&self.handler, PermanentState::Connecting);
        link.generation += 1;
        // the timer stays quiet until the attempt settles
        let _ = self.base.set_timeout_date(NO_TIMEOUT);

        let generation = link.generation;
        let addr = link.addr.clone();
        let port = link.port;

        if let Some(signal) = link.signal.clone() {
            link.in_flight = true;
            let slot = link.slot.clone();
            drop(link);
            let spawned = std::thread::Builder::new()
                .name("pollcomm-connect".into())
                .spawn(move || {
                    let result = TcpStream::connect((addr.as_str(), port)).map_err(|e| e.to_string());
                    *slot.lock() = Some((generation, result));
                    if let Err(e) = signal.signal() {
                        tracing::debug!(error = %e, "connect result abandoned");
                    }
                });
            if let Err(e) = spawned {
                self.link.borrow_mut().in_flight = false;
                failed(&self.link, &self.handler, e.to_string(), comm, Some(&mut self.base));
            }
        } else {
            drop(link);
            match TcpStream::connect((addr.as_str(), port)) {
                Ok(stream) => connected(&self.link, &self.handler, stream, comm, Some(&mut self.base)),
                Err(e) => failed(&self.link, &self.handler, e.to_string(), comm, Some(&mut self.base)),
            }
        }
    }
}

impl<H: PermanentHandler + 'static> Connection for PermanentConnection<H> {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ConnectionBase {
        &mut self.base
    }

    fn valid_socket(&self) -> bool {
        true
    }

    fn on_added(&mut self, comm: &Communicator) {
        let pause = self
            .pause_us
            .unwrap_or_else(|| duration_to_us(comm.config().permanent_pause));
        let use_thread = self.use_thread;
        {
            let mut link = self.link.borrow_mut();
            link.pause_us = pause;
            if use_thread && link.signal.is_none() {
                let waker = ThreadDoneConnection::new(AttemptDone {
                    link: Rc::downgrade(&self.link),
                    handler: self.handler.clone(),
                });
                match waker {
                    Ok(mut waker) => {
                        waker.base_mut().set_name(format!("{} connect", self.base.name()));
                        link.signal = Some(waker.signaler());
                        link.thread_done = Some(waker.base().id());
                        drop(link);
                        if let Err(e) = comm.add(waker) {
                            tracing::warn!(error = %e, "connecting inline");
                            let mut link = self.link.borrow_mut();
                            link.signal = None;
                            link.thread_done = None;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "no thread-done pipe, connecting inline"),
                }
            }
        }
        let first = if pause < 0 { current_date_us() } else { current_date_us() + pause };
        let _ = self.base.set_timeout_date(first);
    }

    fn on_timeout(&mut self, comm: &Communicator) {
        self.attempt(comm);
    }

    fn on_removed(&mut self, comm: &Communicator) {
        let (thread_done, messenger) = {
            let mut link = self.link.borrow_mut();
            let was_done = link.state == PermanentState::Done;
            link.set_state(&self.handler, PermanentState::Done);
            link.signal = None;
            // a done link drains and removes itself
            let messenger = if was_done {
                None
            } else {
                link.messenger = None;
                link.messenger_id.take()
            };
            (link.thread_done.take(), messenger)
        };
        if let Some(id) = thread_done {
            comm.remove_connection(id);
        }
        if let Some(id) = messenger {
            comm.remove_connection(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pollcomm_core::config::CommConfig;
    use std::cell::Cell;

    #[derive(Default)]
    struct Record {
        states: Vec<PermanentState>,
        failures: u32,
        connected: bool,
        stop: Rc<Cell<Option<ConnectionId>>>,
    }

    impl PermanentHandler for Record {
        fn process_message(&mut self, _link: &mut dyn MessageSender, _message: Message, _comm: &Communicator) {}

        fn process_connected(&mut self, _link: &mut dyn MessageSender, _comm: &Communicator) {
            self.connected = true;
        }

        fn process_connection_failed(&mut self, _error: &str, comm: &Communicator) {
            self.failures += 1;
            if self.failures == 3 {
                if let Some(id) = self.stop.get() {
                    comm.remove_connection(id);
                }
            }
        }

        fn on_state_change(&mut self, _from: PermanentState, to: PermanentState) {
            self.states.push(to);
        }
    }

    fn closed_port() -> u16 {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    }

    fn run_unreachable(use_thread: bool) {
        let comm = Communicator::with_config(CommConfig::new());
        let stop = Rc::new(Cell::new(None));
        let client = PermanentConnection::new(
            "127.0.0.1",
            closed_port(),
            Record {
                stop: stop.clone(),
                ..Default::default()
            },
        );
        client.borrow_mut().set_pause(0);
        client.borrow_mut().set_use_thread(use_thread);
        stop.set(Some(client.borrow().base().id()));
        assert!(client.borrow().send(&Message::new("QUEUED").unwrap(), true).is_ok());
        assert!(client.borrow().send(&Message::new("LOST").unwrap(), false).is_err());
        assert_eq!(client.borrow().cache_size(), 1);

        comm.add_connection(client.clone()).unwrap();
        comm.run().unwrap();

        let c = client.borrow();
        let record = c.handler.borrow();
        assert!(!record.connected);
        assert_eq!(record.failures, 3);
        assert_eq!(
            &record.states[..6],
            &[
                PermanentState::Connecting,
                PermanentState::Disconnected,
                PermanentState::Connecting,
                PermanentState::Disconnected,
                PermanentState::Connecting,
                PermanentState::Disconnected,
            ]
        );
        assert_eq!(c.state(), PermanentState::Done);
    }

    #[test]
    fn test_unreachable_inline() {
        run_unreachable(false);
    }

    #[test]
    fn test_unreachable_on_worker() {
        run_unreachable(true);
    }
}
