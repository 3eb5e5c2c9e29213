//! Signal connection
//!
//! Turns deliveries of one POSIX signal into readable events through a
//! `signalfd`. The signal is blocked on the creating thread, so create
//! signal connections before spawning threads that must not see it.
//!
//! At most one live connection per signal number is allowed. The
//! [`SignalRegistry`] enforcing that is a cheap shared handle;
//! [`SignalRegistry::process`] is the one every `Communicator` uses by
//! default.

use std::collections::HashSet;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::{Arc, OnceLock};

use nix::errno::Errno;
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use parking_lot::Mutex;

use crate::communicator::Communicator;
use crate::connection::{Connection, ConnectionBase};
use crate::error::{CommError, CommResult};

/// Set of signal numbers that currently have a live connection.
#[derive(Debug, Clone, Default)]
pub struct SignalRegistry {
    registered: Arc<Mutex<HashSet<i32>>>,
}

impl SignalRegistry {
    /// A fresh, empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn process() -> Self {
        static PROCESS: OnceLock<SignalRegistry> = OnceLock::new();
        PROCESS.get_or_init(SignalRegistry::new).clone()
    }

    pub fn is_registered(&self, signo: i32) -> bool {
        self.registered.lock().contains(&signo)
    }

    fn register(&self, signo: i32) -> CommResult<()> {
        if !self.registered.lock().insert(signo) {
            return Err(CommError::Signal {
                signo,
                reason: "already registered",
            });
        }
        Ok(())
    }

    fn unregister(&self, signo: i32) {
        self.registered.lock().remove(&signo);
    }
}

/// One decoded delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalInfo {
    pub signo: i32,
    /// Sending (or, for `SIGCHLD`, exiting child) process.
    pub pid: u32,
    /// Exit status for `SIGCHLD`.
    pub status: i32,
    pub code: i32,
}

pub trait SignalHandler {
    fn on_signal(&mut self, base: &mut ConnectionBase, info: &SignalInfo, comm: &Communicator);
}

impl<F> SignalHandler for F
where
    F: FnMut(&mut ConnectionBase, &SignalInfo, &Communicator),
{
    fn on_signal(&mut self, base: &mut ConnectionBase, info: &SignalInfo, comm: &Communicator) {
        self(base, info, comm)
    }
}

pub struct SignalConnection<H> {
    base: ConnectionBase,
    signal: Signal,
    fd: Option<SignalFd>,
    registry: SignalRegistry,
    unblock_on_drop: bool,
    handler: H,
}

impl<H: SignalHandler> SignalConnection<H> {
    /// Register `signal`, block it on this thread and open its descriptor.
    pub fn new(registry: &SignalRegistry, signal: Signal, handler: H) -> CommResult<Self> {
        let signo = signal as i32;
        if matches!(signal, Signal::SIGKILL | Signal::SIGSTOP) {
            return Err(CommError::Signal {
                signo,
                reason: "cannot be caught",
            });
        }
        registry.register(signo)?;

        let mut mask = SigSet::empty();
        mask.add(signal);
        let fd = mask
            .thread_block()
            .and_then(|_| SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC));
        let fd = match fd {
            Ok(fd) => fd,
            Err(errno) => {
                registry.unregister(signo);
                return Err(CommError::Os { op: "signalfd", errno });
            }
        };
        tracing::debug!(signal = %signal, fd = fd.as_fd().as_raw_fd(), "signal connection opened");

        Ok(Self {
            base: ConnectionBase::new(format!("signal {}", signal)),
            signal,
            fd: Some(fd),
            registry: registry.clone(),
            unblock_on_drop: false,
            handler,
        })
    }

    /// Same as [`new`](Self::new) from a raw signal number.
    pub fn from_number(registry: &SignalRegistry, signo: i32, handler: H) -> CommResult<Self> {
        let signal = Signal::try_from(signo).map_err(|_| CommError::Signal {
            signo,
            reason: "invalid signal number",
        })?;
        Self::new(registry, signal, handler)
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }

    /// Unblock the signal on this thread when the connection is dropped.
    pub fn set_unblock_on_drop(&mut self, unblock: bool) {
        self.unblock_on_drop = unblock;
    }

    pub fn close(&mut self) {
        self.fd = None;
    }
}

impl<H: SignalHandler> Connection for SignalConnection<H> {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ConnectionBase {
        &mut self.base
    }

    fn socket(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_fd().as_raw_fd())
    }

    fn is_signal(&self) -> bool {
        true
    }

    fn drain_signal(&mut self, comm: &Communicator) {
        loop {
            let Some(fd) = self.fd.as_mut() else {
                return;
            };
            let raw = match fd.read_signal() {
                Ok(Some(raw)) => raw,
                Ok(None) => return,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    tracing::warn!(signal = %self.signal, %errno, "signalfd read failed");
                    self.on_error(comm);
                    return;
                }
            };
            let info = SignalInfo {
                signo: raw.ssi_signo as i32,
                pid: raw.ssi_pid,
                status: raw.ssi_status,
                code: raw.ssi_code,
            };
            tracing::trace!(signal = %self.signal, pid = info.pid, "signal delivered");
            self.handler.on_signal(&mut self.base, &info, comm);
        }
    }

    fn on_removed(&mut self, _comm: &Communicator) {
        self.close();
    }
}

impl<H> Drop for SignalConnection<H> {
    fn drop(&mut self) {
        self.fd = None;
        self.registry.unregister(self.signal as i32);
        if self.unblock_on_drop {
            let mut mask = SigSet::empty();
            mask.add(self.signal);
            if let Err(errno) = mask.thread_unblock() {
                tracing::warn!(signal = %self.signal, %errno, "failed to unblock signal");
            }
        }
    }
}
