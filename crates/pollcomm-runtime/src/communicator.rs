//! # Communicator, the reactor
//!
//! Owns the set of registered connections and runs the poll/dispatch
//! loop on the calling thread.
//!
//! One pass:
//! 1. sort by priority if anything changed since the last pass
//! 2. retire connections that are done and have nothing left to write
//! 3. snapshot each enabled connection's timeout timestamp and build the
//!    `pollfd` set from its capability flags
//! 4. wait until the earliest timeout (or forever if there is none)
//! 5. dispatch read (signal / accept / read), write, error, hangup,
//!    invalid for every signaled connection, in priority order
//! 6. fire due timeouts, in priority order
//!
//! [`Communicator::run`] returns `Ok(())` once no connection is left.
//!
//! The handle is cheap to clone; callbacks receive `&Communicator` and
//! may add or remove connections, including themselves, at any time.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use nix::errno::Errno;
use pollcomm_core::config::CommConfig;
use pollcomm_core::time::{current_date_us, NO_TIMEOUT};

use crate::connection::{Connection, ConnectionId, ConnectionRef};
use crate::error::{CommError, CommResult};
use crate::signal::SignalRegistry;

#[derive(Clone)]
struct Entry {
    id: ConnectionId,
    seq: u64,
    conn: ConnectionRef,
}

#[derive(Debug, Clone, Copy)]
enum Hook {
    Added,
    Removed,
}

struct State {
    entries: Vec<Entry>,
    next_seq: u64,
    hooks: VecDeque<(ConnectionRef, Hook)>,
}

struct Inner {
    state: RefCell<State>,
    sort_dirty: Rc<Cell<bool>>,
    config: CommConfig,
    signals: SignalRegistry,
}

/// Handle to a single-threaded reactor.
#[derive(Clone)]
pub struct Communicator {
    inner: Rc<Inner>,
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl Default for Communicator {
    fn default() -> Self {
        Self::new()
    }
}

/// One `pollfd` slot and the snapshot entry it belongs to.
struct Polled {
    index: usize,
    pending_input: bool,
}

impl Communicator {
    /// Create a reactor with the environment-derived configuration.
    pub fn new() -> Self {
        Self::with_config(CommConfig::from_env())
    }

    pub fn with_config(config: CommConfig) -> Self {
        Self::with_parts(config, SignalRegistry::process())
    }

    /// Create a reactor sharing an existing signal registry.
    pub fn with_parts(config: CommConfig, signals: SignalRegistry) -> Self {
        Self {
            inner: Rc::new(Inner {
                state: RefCell::new(State {
                    entries: Vec::new(),
                    next_seq: 0,
                    hooks: VecDeque::new(),
                }),
                sort_dirty: Rc::new(Cell::new(false)),
                config,
                signals,
            }),
        }
    }

    pub fn config(&self) -> &CommConfig {
        &self.inner.config
    }

    /// Registry that enforces one live signal connection per signal.
    pub fn signals(&self) -> &SignalRegistry {
        &self.inner.signals
    }

    /// Register a connection and return the typed handle.
    pub fn add<C: Connection + 'static>(&self, conn: C) -> CommResult<Rc<RefCell<C>>> {
        let conn = Rc::new(RefCell::new(conn));
        self.add_connection(conn.clone())?;
        Ok(conn)
    }

    /// Register a connection.
    ///
    /// Fails without any change if the connection is already registered,
    /// has no valid descriptor, or is currently borrowed.
    pub fn add_connection(&self, conn: ConnectionRef) -> CommResult<()> {
        let (id, name) = {
            let mut c = conn
                .try_borrow_mut()
                .map_err(|_| CommError::InvalidConnection("<busy>".into()))?;
            let id = c.base().id();
            let name = c.base().name().to_string();
            if !c.valid_socket() {
                return Err(CommError::InvalidConnection(name));
            }
            if self.contains(id) {
                return Err(CommError::AlreadyAdded(name));
            }
            c.base_mut().attach(self.inner.sort_dirty.clone());
            (id, name)
        };

        {
            let mut state = self.inner.state.borrow_mut();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.push(Entry {
                id,
                seq,
                conn: conn.clone(),
            });
            state.hooks.push_back((conn, Hook::Added));
        }
        self.inner.sort_dirty.set(true);
        tracing::trace!(connection = %name, %id, "connection added");

        self.flush_hooks();
        Ok(())
    }

    /// Unregister a connection. Returns whether it was registered.
    ///
    /// `on_removed` runs as soon as the connection is not borrowed, which
    /// for a connection removing itself is right after its callback.
    pub fn remove_connection(&self, id: ConnectionId) -> bool {
        {
            let mut state = self.inner.state.borrow_mut();
            let Some(pos) = state.entries.iter().position(|e| e.id == id) else {
                return false;
            };
            let entry = state.entries.remove(pos);
            state.hooks.push_back((entry.conn, Hook::Removed));
        }
        self.inner.sort_dirty.set(true);
        tracing::trace!(%id, "connection removed");

        self.flush_hooks();
        true
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.state.borrow().entries.iter().any(|e| e.id == id)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.state.borrow().entries.len()
    }

    /// Snapshot of the registered connections, in dispatch order.
    pub fn connections(&self) -> Vec<ConnectionRef> {
        self.sort_if_dirty();
        self.inner
            .state
            .borrow()
            .entries
            .iter()
            .map(|e| e.conn.clone())
            .collect()
    }

    /// Run until no connection is left.
    pub fn run(&self) -> CommResult<()> {
        tracing::debug!(connections = self.connection_count(), "communicator running");
        loop {
            if !self.pass()? {
                tracing::debug!("communicator done, no connection left");
                return Ok(());
            }
        }
    }

    /// Run one poll/dispatch pass. Returns `false` once empty.
    fn pass(&self) -> CommResult<bool> {
        self.flush_hooks();
        self.sort_if_dirty();

        let snapshot: Vec<Entry> = self.inner.state.borrow().entries.clone();
        if snapshot.is_empty() {
            return Ok(false);
        }

        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(snapshot.len());
        let mut polled: Vec<Polled> = Vec::with_capacity(snapshot.len());
        let mut timed: Vec<usize> = Vec::new();
        let mut next_timeout = NO_TIMEOUT;
        let mut any_pending = false;
        // callbacks of this pass go by the flag as it was here
        let mut enabled = vec![false; snapshot.len()];

        for (index, entry) in snapshot.iter().enumerate() {
            let Ok(mut c) = entry.conn.try_borrow_mut() else {
                continue;
            };
            if !c.base().is_enabled() {
                continue;
            }
            if c.base().is_done() && !c.is_writer() {
                drop(c);
                self.remove_connection(entry.id);
                continue;
            }
            enabled[index] = true;

            let ts = c.base_mut().save_timeout_timestamp();
            if ts != NO_TIMEOUT {
                timed.push(index);
                if next_timeout == NO_TIMEOUT || ts < next_timeout {
                    next_timeout = ts;
                }
            }

            let pending_input = c.has_pending_input();
            any_pending |= pending_input;

            if let Some(fd) = c.socket() {
                let mut events: libc::c_short = 0;
                if c.is_listener() || c.is_signal() {
                    events |= libc::POLLIN;
                }
                if c.is_reader() {
                    events |= libc::POLLIN | libc::POLLPRI | libc::POLLRDHUP;
                }
                if c.is_writer() {
                    events |= libc::POLLOUT | libc::POLLRDHUP;
                }
                if events != 0 {
                    fds.push(libc::pollfd { fd, events, revents: 0 });
                    polled.push(Polled { index, pending_input });
                    continue;
                }
            }
            if pending_input {
                // keep the slot so the buffered lines get dispatched
                fds.push(libc::pollfd { fd: -1, events: 0, revents: 0 });
                polled.push(Polled { index, pending_input });
            }
        }

        if self.connection_count() == 0 {
            return Ok(false);
        }
        if fds.is_empty() && next_timeout == NO_TIMEOUT {
            tracing::error!(
                connections = self.connection_count(),
                "no descriptor and no timeout to wait on"
            );
            return Err(CommError::Exhausted);
        }

        let timeout_ms: libc::c_int = if any_pending {
            0
        } else if next_timeout == NO_TIMEOUT {
            -1
        } else {
            let wait = next_timeout - current_date_us();
            if wait <= 0 {
                0
            } else {
                ((wait + 999) / 1000).min(libc::c_int::MAX as i64) as libc::c_int
            }
        };

        let r = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if r < 0 {
            let errno = Errno::last();
            if errno == Errno::EINTR {
                return Ok(true);
            }
            tracing::error!(%errno, fds = fds.len(), "poll failed");
            return Err(CommError::Poll(errno));
        }

        for (pfd, slot) in fds.iter().zip(&polled) {
            let rev = pfd.revents;
            let entry = &snapshot[slot.index];
            let on = enabled[slot.index];

            if rev & (libc::POLLIN | libc::POLLPRI) != 0 || slot.pending_input {
                self.dispatch(entry, on, |c, comm| {
                    if c.is_signal() {
                        c.drain_signal(comm);
                    } else if c.is_listener() {
                        c.on_accept_ready(comm);
                    } else {
                        c.on_read_ready(comm);
                    }
                });
            }
            if rev & libc::POLLOUT != 0 {
                self.dispatch(entry, on, |c, comm| c.on_write_ready(comm));
            }
            if rev & libc::POLLERR != 0 {
                self.dispatch(entry, on, |c, comm| c.on_error(comm));
            }
            if rev & (libc::POLLHUP | libc::POLLRDHUP) != 0 {
                self.dispatch(entry, on, |c, comm| c.on_hangup(comm));
            }
            if rev & libc::POLLNVAL != 0 {
                self.dispatch(entry, on, |c, comm| c.on_invalid(comm));
            }
        }

        let now = current_date_us();
        for index in timed {
            let entry = &snapshot[index];
            self.dispatch(entry, enabled[index], |c, comm| {
                let ts = c.base().saved_timeout_timestamp();
                if ts == NO_TIMEOUT || ts > now {
                    return;
                }
                let base = c.base_mut();
                base.clear_fired_date(now);
                base.compute_next_tick_at(now);
                c.on_timeout(comm);
            });
        }

        Ok(true)
    }

    /// Invoke `f` on a connection that is still registered and was enabled
    /// when the pass started.
    fn dispatch<F>(&self, entry: &Entry, enabled: bool, f: F)
    where
        F: FnOnce(&mut dyn Connection, &Communicator),
    {
        if !enabled || !self.contains(entry.id) {
            return;
        }
        {
            let Ok(mut c) = entry.conn.try_borrow_mut() else {
                tracing::warn!(id = %entry.id, "connection busy, callback skipped");
                return;
            };
            f(&mut *c, self);
        }
        self.flush_hooks();
    }

    fn sort_if_dirty(&self) {
        if !self.inner.sort_dirty.replace(false) {
            return;
        }
        let mut state = self.inner.state.borrow_mut();
        let mut keyed: Vec<(i32, u64, Entry)> = Vec::with_capacity(state.entries.len());
        for entry in state.entries.drain(..) {
            let priority = match entry.conn.try_borrow() {
                Ok(c) => c.base().priority(),
                Err(_) => {
                    // try again next pass
                    self.inner.sort_dirty.set(true);
                    pollcomm_core::defaults::DEFAULT_PRIORITY
                }
            };
            keyed.push((priority, entry.seq, entry));
        }
        keyed.sort_by_key(|(priority, seq, _)| (*priority, *seq));
        state.entries = keyed.into_iter().map(|(_, _, e)| e).collect();
    }

    /// Run queued `on_added` / `on_removed` hooks on idle connections.
    fn flush_hooks(&self) {
        let mut deferred = Vec::new();
        loop {
            let next = self.inner.state.borrow_mut().hooks.pop_front();
            let Some((conn, hook)) = next else {
                break;
            };
            let mut c = match conn.try_borrow_mut() {
                Ok(c) => c,
                Err(_) => {
                    deferred.push((conn.clone(), hook));
                    continue;
                }
            };
            match hook {
                Hook::Added => c.on_added(self),
                Hook::Removed => {
                    c.base_mut().detach();
                    c.on_removed(self);
                }
            }
        }
        if !deferred.is_empty() {
            self.inner.state.borrow_mut().hooks.extend(deferred);
        }
    }
}
