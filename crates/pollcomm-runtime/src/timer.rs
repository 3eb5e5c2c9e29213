//! Timer connection
//!
//! No descriptor, only a timeout. `delay == 0` fires once, as soon as
//! possible; `delay > 0` repeats on a drift-free schedule.
//!
//! A one-shot timer that is not rescheduled from its callback has nothing
//! left to wait for; call `mark_done()` (or remove it) once it is spent.

use pollcomm_core::time::{current_date_us, NO_TIMEOUT};

use crate::communicator::Communicator;
use crate::connection::{Connection, ConnectionBase};
use crate::error::{CommError, CommResult};

/// Callback invoked on every timer expiry.
///
/// The timer's base is passed so the callback can reschedule
/// (`set_timeout_date`, `set_timeout_delay`) or `mark_done()`.
pub trait TimerHandler {
    fn on_timeout(&mut self, timer: &mut ConnectionBase, comm: &Communicator);
}

impl<F> TimerHandler for F
where
    F: FnMut(&mut ConnectionBase, &Communicator),
{
    fn on_timeout(&mut self, timer: &mut ConnectionBase, comm: &Communicator) {
        self(timer, comm)
    }
}

pub struct TimerConnection<H> {
    base: ConnectionBase,
    handler: H,
}

impl<H: TimerHandler> TimerConnection<H> {
    /// Create a timer.
    ///
    /// `delay_us`: `0` one-shot now, `> 0` repeating, `-1` idle until
    /// rescheduled. Other negative values and repeating delays below
    /// 10µs are rejected.
    pub fn new(delay_us: i64, handler: H) -> CommResult<Self> {
        Self::with_base(ConnectionBase::new("timer"), delay_us, handler)
    }

    /// Same as [`new`](Self::new) with a caller-provided base.
    pub fn with_base(mut base: ConnectionBase, delay_us: i64, handler: H) -> CommResult<Self> {
        match delay_us {
            0 => base.set_timeout_date(current_date_us())?,
            NO_TIMEOUT => {}
            d if d < 0 => {
                return Err(CommError::InvalidParameter(format!("timer delay {}us is negative", d)));
            }
            d => base.set_timeout_delay(d)?,
        }
        Ok(Self { base, handler })
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }
}

impl<H: TimerHandler> Connection for TimerConnection<H> {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ConnectionBase {
        &mut self.base
    }

    fn valid_socket(&self) -> bool {
        true
    }

    fn on_timeout(&mut self, comm: &Communicator) {
        self.handler.on_timeout(&mut self.base, comm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pollcomm_core::config::CommConfig;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_delay_validation() {
        let noop = |_: &mut ConnectionBase, _: &Communicator| {};
        assert!(TimerConnection::new(-2, noop).is_err());
        assert!(TimerConnection::new(5, noop).is_err());

        let idle = TimerConnection::new(NO_TIMEOUT, noop).unwrap();
        assert_eq!(idle.base().timeout_timestamp(), NO_TIMEOUT);

        let once = TimerConnection::new(0, noop).unwrap();
        assert!(once.base().timeout_date() > 0);
        assert_eq!(once.base().timeout_delay(), NO_TIMEOUT);

        let every = TimerConnection::new(1_000, noop).unwrap();
        assert_eq!(every.base().timeout_delay(), 1_000);
    }

    #[test]
    fn test_one_shot_reschedules_itself() {
        let comm = Communicator::with_config(CommConfig::new());
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        comm.add(
            TimerConnection::new(0, move |base: &mut ConnectionBase, _: &Communicator| {
                c.set(c.get() + 1);
                if c.get() < 3 {
                    base.set_timeout_date(current_date_us() + 100).unwrap();
                } else {
                    base.mark_done();
                }
            })
            .unwrap(),
        )
        .unwrap();
        comm.run().unwrap();
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn test_repeating_timer_ticks() {
        let comm = Communicator::with_config(CommConfig::new());
        let ticks = Rc::new(Cell::new(0));
        let t = ticks.clone();
        let timer = comm
            .add(
                TimerConnection::new(1_000, move |base: &mut ConnectionBase, _: &Communicator| {
                    t.set(t.get() + 1);
                    if t.get() == 4 {
                        base.mark_done();
                    }
                })
                .unwrap(),
            )
            .unwrap();
        let origin = timer.borrow().base().timeout_next_date() - 1_000;
        comm.run().unwrap();
        assert_eq!(ticks.get(), 4);
        let next = timer.borrow().base().timeout_next_date();
        assert_eq!((next - origin) % 1_000, 0);
    }
}
