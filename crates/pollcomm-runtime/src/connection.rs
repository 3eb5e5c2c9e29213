//! Connection contract
//!
//! Every event source handled by the [`Communicator`] implements
//! [`Connection`]. The trait is the only thing the reactor knows about:
//! capability queries decide which readiness events to wait for, and
//! the `on_*` callbacks are invoked when they happen.
//!
//! State shared by all connections (name, priority, limits, timeout
//! schedule) lives in [`ConnectionBase`], which each concrete type embeds
//! and exposes through [`Connection::base`] / [`Connection::base_mut`].
//!
//! # Timeouts
//!
//! A connection may carry a repeating timeout (`delay`, in microseconds)
//! and/or a one-shot absolute `date`. Repeating ticks are computed from
//! the origin set by [`ConnectionBase::set_timeout_delay`], so missed
//! ticks are skipped instead of accumulating drift.

use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use pollcomm_core::config::{defaults, CommConfig};
use pollcomm_core::time::{current_date_us, duration_to_us, NO_TIMEOUT};

use crate::communicator::Communicator;
use crate::error::{CommError, CommResult};

/// Shared handle the reactor keeps for every registered connection.
pub type ConnectionRef = Rc<RefCell<dyn Connection>>;

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next identifier
    #[inline]
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ConnectionId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value (for logging)
    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State common to every connection.
#[derive(Debug)]
pub struct ConnectionBase {
    id: ConnectionId,
    name: String,
    priority: i32,
    enabled: bool,
    done: bool,
    event_limit: i64,
    processing_time_limit: i64,
    timeout_delay: i64,
    timeout_next_date: i64,
    timeout_date: i64,
    saved_timeout_timestamp: i64,
    sort_flag: Option<Rc<Cell<bool>>>,
}

impl ConnectionBase {
    /// Create a base with library defaults and no timeout.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ConnectionId::next(),
            name: name.into(),
            priority: defaults::DEFAULT_PRIORITY,
            enabled: true,
            done: false,
            event_limit: defaults::EVENT_LIMIT,
            processing_time_limit: defaults::PROCESSING_TIME_LIMIT_US,
            timeout_delay: NO_TIMEOUT,
            timeout_next_date: NO_TIMEOUT,
            timeout_date: NO_TIMEOUT,
            saved_timeout_timestamp: NO_TIMEOUT,
            sort_flag: None,
        }
    }

    /// Create a base taking priority and per-pass limits from `config`.
    pub fn with_config(name: impl Into<String>, config: &CommConfig) -> Self {
        let mut base = Self::new(name);
        base.priority = config.default_priority.clamp(0, defaults::MAX_PRIORITY);
        base.event_limit = config.event_limit.max(1);
        base.processing_time_limit = duration_to_us(config.processing_time_limit);
        base
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Disabled connections are skipped by the reactor entirely.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Ask for removal once pending output is flushed.
    pub fn mark_done(&mut self) {
        self.done = true;
    }

    /// Clear the done flag (used by reconnecting connections).
    pub fn mark_not_done(&mut self) {
        self.done = false;
    }

    #[inline]
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Change the dispatch priority (0 runs first).
    pub fn set_priority(&mut self, priority: i32) -> CommResult<()> {
        if !(0..=defaults::MAX_PRIORITY).contains(&priority) {
            return Err(CommError::InvalidParameter(format!(
                "priority {} out of range [0, {}]",
                priority,
                defaults::MAX_PRIORITY
            )));
        }
        if priority != self.priority {
            self.priority = priority;
            if let Some(flag) = &self.sort_flag {
                flag.set(true);
            }
        }
        Ok(())
    }

    #[inline]
    pub fn event_limit(&self) -> i64 {
        self.event_limit
    }

    /// Maximum lines/messages handled per pass (at least 1).
    pub fn set_event_limit(&mut self, limit: i64) -> CommResult<()> {
        if limit < 1 {
            return Err(CommError::InvalidParameter(format!("event limit {} must be at least 1", limit)));
        }
        self.event_limit = limit;
        Ok(())
    }

    #[inline]
    pub fn processing_time_limit(&self) -> i64 {
        self.processing_time_limit
    }

    /// Wall-clock budget per pass in microseconds, at least 10ms, or -1.
    pub fn set_processing_time_limit(&mut self, limit_us: i64) -> CommResult<()> {
        if limit_us != NO_TIMEOUT && limit_us < 10_000 {
            return Err(CommError::InvalidParameter(format!(
                "processing time limit {}us is below 10ms",
                limit_us
            )));
        }
        self.processing_time_limit = limit_us;
        Ok(())
    }

    #[inline]
    pub fn timeout_delay(&self) -> i64 {
        self.timeout_delay
    }

    /// Set a repeating timeout, in microseconds, starting now.
    ///
    /// `-1` disables it. Anything else below 10µs is rejected.
    pub fn set_timeout_delay(&mut self, delay_us: i64) -> CommResult<()> {
        self.set_timeout_delay_from(delay_us, current_date_us())
    }

    /// Same as [`set_timeout_delay`](Self::set_timeout_delay) with an explicit origin.
    pub fn set_timeout_delay_from(&mut self, delay_us: i64, origin_us: i64) -> CommResult<()> {
        if delay_us != NO_TIMEOUT && delay_us < defaults::MIN_DELAY_US {
            return Err(CommError::InvalidParameter(format!(
                "timeout delay {}us is below the {}us minimum",
                delay_us,
                defaults::MIN_DELAY_US
            )));
        }
        self.timeout_delay = delay_us;
        self.timeout_next_date = if delay_us == NO_TIMEOUT {
            NO_TIMEOUT
        } else {
            origin_us + delay_us
        };
        Ok(())
    }

    #[inline]
    pub fn timeout_next_date(&self) -> i64 {
        self.timeout_next_date
    }

    #[inline]
    pub fn timeout_date(&self) -> i64 {
        self.timeout_date
    }

    /// Set a one-shot absolute timeout (µs since epoch), or -1 to clear.
    pub fn set_timeout_date(&mut self, date_us: i64) -> CommResult<()> {
        if date_us < NO_TIMEOUT {
            return Err(CommError::InvalidParameter(format!("timeout date {} is negative", date_us)));
        }
        self.timeout_date = date_us;
        Ok(())
    }

    /// Earliest pending timeout: next repeating tick or one-shot date.
    pub fn timeout_timestamp(&self) -> i64 {
        let tick = if self.timeout_delay != NO_TIMEOUT {
            self.timeout_next_date
        } else {
            NO_TIMEOUT
        };
        match (tick, self.timeout_date) {
            (NO_TIMEOUT, date) => date,
            (tick, NO_TIMEOUT) => tick,
            (tick, date) => tick.min(date),
        }
    }

    /// Advance the repeating schedule past the current time.
    pub fn compute_next_tick(&mut self) {
        self.compute_next_tick_at(current_date_us());
    }

    /// Advance the repeating schedule past `now_us`.
    ///
    /// The next tick moves by the smallest multiple of `delay` that puts
    /// it strictly after `now_us`, so ticks stay aligned on the origin.
    pub fn compute_next_tick_at(&mut self, now_us: i64) {
        if self.timeout_delay == NO_TIMEOUT {
            return;
        }
        if self.timeout_next_date == NO_TIMEOUT {
            self.timeout_next_date = now_us + self.timeout_delay;
            return;
        }
        if self.timeout_next_date <= now_us {
            let skipped = (now_us - self.timeout_next_date) / self.timeout_delay + 1;
            self.timeout_next_date += skipped * self.timeout_delay;
        }
    }

    pub(crate) fn save_timeout_timestamp(&mut self) -> i64 {
        self.saved_timeout_timestamp = self.timeout_timestamp();
        self.saved_timeout_timestamp
    }

    #[inline]
    pub(crate) fn saved_timeout_timestamp(&self) -> i64 {
        self.saved_timeout_timestamp
    }

    /// Clear the one-shot date if it is due. Returns whether it was.
    pub(crate) fn clear_fired_date(&mut self, now_us: i64) -> bool {
        if self.timeout_date != NO_TIMEOUT && self.timeout_date <= now_us {
            self.timeout_date = NO_TIMEOUT;
            return true;
        }
        false
    }

    pub(crate) fn attach(&mut self, sort_flag: Rc<Cell<bool>>) {
        self.sort_flag = Some(sort_flag);
    }

    pub(crate) fn detach(&mut self) {
        self.sort_flag = None;
    }
}

/// An event source registered with the reactor.
///
/// All callbacks have a default. Capability queries default to "nothing",
/// error/hangup/invalid default to removing the connection.
pub trait Connection {
    fn base(&self) -> &ConnectionBase;
    fn base_mut(&mut self) -> &mut ConnectionBase;

    /// Descriptor to wait on, if any.
    fn socket(&self) -> Option<RawFd> {
        None
    }

    /// Whether the connection may be added to the reactor.
    fn valid_socket(&self) -> bool {
        self.socket().is_some()
    }

    fn is_listener(&self) -> bool {
        false
    }

    fn is_signal(&self) -> bool {
        false
    }

    fn is_reader(&self) -> bool {
        false
    }

    fn is_writer(&self) -> bool {
        false
    }

    /// Complete input is buffered and waits for the next pass.
    ///
    /// The reactor then does not block and calls `on_read_ready` again
    /// even if the descriptor itself is not readable.
    fn has_pending_input(&self) -> bool {
        false
    }

    /// An earlier I/O error was recorded on the descriptor.
    fn has_socket_error(&self) -> bool {
        false
    }

    fn on_timeout(&mut self, _comm: &Communicator) {}

    /// Drain every pending signal delivery. Only called when `is_signal()`.
    fn drain_signal(&mut self, _comm: &Communicator) {}

    fn on_read_ready(&mut self, _comm: &Communicator) {}

    fn on_write_ready(&mut self, _comm: &Communicator) {}

    fn on_accept_ready(&mut self, _comm: &Communicator) {}

    /// All queued output was written.
    fn on_output_drained(&mut self, comm: &Communicator) {
        if self.base().is_done() && !self.has_socket_error() {
            comm.remove_connection(self.base().id());
        }
    }

    fn on_error(&mut self, comm: &Communicator) {
        tracing::debug!(connection = %self.base().name(), "socket error, removing connection");
        comm.remove_connection(self.base().id());
    }

    fn on_hangup(&mut self, comm: &Communicator) {
        tracing::debug!(connection = %self.base().name(), "hangup, removing connection");
        comm.remove_connection(self.base().id());
    }

    fn on_invalid(&mut self, comm: &Communicator) {
        tracing::debug!(connection = %self.base().name(), "invalid socket, removing connection");
        comm.remove_connection(self.base().id());
    }

    fn on_added(&mut self, _comm: &Communicator) {}

    /// Last call before the reactor drops its handle. Release descriptors here.
    fn on_removed(&mut self, _comm: &Communicator) {}
}
