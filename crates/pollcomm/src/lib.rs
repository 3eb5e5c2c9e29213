//! # pollcomm - poll reactor and message protocol
//!
//! One thread, one `poll(2)` loop, many event sources.
//!
//! ## Features
//!
//! - **Ordered dispatch**: connections run by priority, then by the order
//!   they were added
//! - **Fairness**: per-connection event and time budgets for each pass
//! - **Timers**: one-shot dates and drift-free repeating delays
//! - **Signals**: `signalfd` backed, one live connection per signal
//! - **Streams**: pipes and TCP, raw, line buffered or message framed
//! - **Datagrams**: UDP messages with an optional shared secret
//! - **Reconnection**: a permanent client that caches output while down
//! - **File watches**: inotify events mapped to a portable set
//!
//! ## Quick Start
//!
//! ```ignore
//! use pollcomm::prelude::*;
//!
//! fn main() -> CommResult<()> {
//!     pollcomm::init_logging();
//!     let comm = Communicator::new();
//!
//!     let server = TcpServerConnection::bind("127.0.0.1", 4000, TcpServerOptions::default(),
//!         |_: &mut ConnectionBase, client: TcpServerClient, comm: &Communicator| {
//!             let echo = TcpServerClientMessageConnection::with_messages(client,
//!                 |core: &mut BufferCore<TcpServerClient>, m: Message, _: &Communicator| {
//!                     let _ = core.send_message(&m);
//!                 });
//!             let _ = comm.add(echo);
//!         })?;
//!     comm.add(server)?;
//!     comm.run()
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Communicator                           │
//! │     sort by (priority, seq), build pollfds, dispatch        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │  Connection trait
//!       ┌──────────┬───────────┼───────────┬──────────────┐
//!       ▼          ▼           ▼           ▼              ▼
//!    Timer      Signal     Stream layers   UDP        FsWatch
//!  Permanent  ThreadDone   raw/line/msg   server      inotify
//!            InterThread   pipe / TCP
//!                              │
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │            pollcomm-core: Message codec                 │
//!    │   [<from_server:from_service ][server:][service/]CMD    │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use pollcomm_core::{
    current_date_us,
    defaults,
    CommConfig,
    Message,
    MessageError,
    MessageResult,
    NO_TIMEOUT,
};
pub use pollcomm_core::logging::init as init_logging;

// Re-export env utilities
pub use pollcomm_core::{env_get, env_get_bool, env_get_opt};

// Re-export runtime types
pub use pollcomm_runtime::*;

/// Everything needed to write a handler.
pub mod prelude {
    pub use pollcomm_core::{CommConfig, Message};
    pub use pollcomm_runtime::{
        BufferCore, CommError, CommResult, Communicator, Connection, ConnectionBase, ConnectionId,
        FileEvent, FileEvents, FsWatchConnection, InterThreadConnection, InterThreadHandler,
        MessageSender, PermanentConnection, PermanentHandler, PermanentState, PipeEnd,
        PipeMessageConnection, SignalConnection, SignalInfo, TcpClient, TcpClientMessageConnection,
        TcpServerClient, TcpServerClientMessageConnection, TcpServerConnection, TcpServerOptions,
        ThreadDoneConnection, TimerConnection, UdpMessageConnection,
    };
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_prelude_runs_a_timer() {
        let comm = Communicator::with_config(CommConfig::new());
        let fired = Rc::new(Cell::new(0));
        let f = fired.clone();
        comm.add(
            TimerConnection::new(0, move |base: &mut ConnectionBase, _: &Communicator| {
                f.set(f.get() + 1);
                base.mark_done();
            })
            .unwrap(),
        )
        .unwrap();
        comm.run().unwrap();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_message_reexport() {
        let m = super::Message::parse("svc/PING n=1").unwrap();
        pretty_assertions::assert_eq!(m.service(), "svc");
        assert_eq!(super::defaults::UDP_MAX_DATAGRAM, 1024);
    }
}
