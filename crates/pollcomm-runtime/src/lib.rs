//! # pollcomm-runtime
//!
//! Single-threaded readiness reactor and the connection families it
//! drives.
//!
//! ## Modules
//!
//! - `communicator` - the reactor: registration, ordering, one wait pass
//! - `connection` - the `Connection` trait and shared `ConnectionBase`
//! - `timer` - one-shot and repeating timers
//! - `signal` - POSIX signals through `signalfd`
//! - `thread_done` - wake the reactor from a worker thread
//! - `inter_thread` - two-sided message queue between threads
//! - `stream` - raw, buffered and message layers over a byte transport
//! - `pipe` - socket pair meant to be shared across `fork`
//! - `tcp` - client, accepted client and listening server
//! - `udp` - datagram server, message server and one-shot sender
//! - `permanent` - reconnecting TCP message client with an output cache
//! - `blocking` - synchronous request/response client
//! - `fswatch` - filesystem change notifications
//! - `error` - error types
//!
//! ## Threading
//!
//! A [`Communicator`] and its connections belong to one thread. Only
//! [`ThreadDoneSignal`] and [`InterThreadPeer`] cross threads.
//!
//! ```ignore
//! use pollcomm_runtime::{Communicator, TimerConnection, ConnectionBase};
//!
//! let comm = Communicator::new();
//! let timer = TimerConnection::new(100_000, |t: &mut ConnectionBase, _: &Communicator| {
//!     t.mark_done();
//! })?;
//! comm.add(timer)?;
//! comm.run()?;
//! ```

pub(crate) mod fd;

pub mod error;
pub mod connection;
pub mod communicator;
pub mod timer;
pub mod signal;
pub mod thread_done;
pub mod inter_thread;
pub mod stream;
pub mod pipe;
pub mod tcp;
pub mod udp;
pub mod permanent;
pub mod blocking;
pub mod fswatch;

// Re-exports for convenience
pub use error::{CommError, CommResult};
pub use connection::{Connection, ConnectionBase, ConnectionId, ConnectionRef};
pub use communicator::Communicator;
pub use timer::{TimerConnection, TimerHandler};
pub use signal::{SignalConnection, SignalHandler, SignalInfo, SignalRegistry};
pub use thread_done::{ThreadDoneConnection, ThreadDoneHandler, ThreadDoneSignal};
pub use inter_thread::{InterThreadConnection, InterThreadHandler, InterThreadPeer};
pub use stream::{
    BufferConnection, BufferCore, CloseReason, LineHandler, MessageConnection, MessageHandler,
    MessageLines, MessageSender, StreamConnection, StreamHandler, Transport,
};
pub use pipe::{PipeBufferConnection, PipeConnection, PipeEnd, PipeMessageConnection};
pub use tcp::{
    AcceptHandler, ByteStream, SecureMode, SecureUpgrade, TcpClient, TcpClientBufferConnection,
    TcpClientConnection, TcpClientMessageConnection, TcpServerClient,
    TcpServerClientBufferConnection, TcpServerClientConnection, TcpServerClientMessageConnection,
    TcpServerConnection, TcpServerOptions,
};
pub use udp::{
    DatagramHandler, UdpMessageConnection, UdpMessageHandler, UdpMessages, UdpServerConnection,
    UDP_SECRET_PARAMETER,
};
pub use permanent::{PermanentConnection, PermanentHandler, PermanentState};
pub use blocking::{BlockingHandler, BlockingLink, BlockingMessageConnection};
pub use fswatch::{FileEvent, FileEvents, FsHandler, FsWatchConnection};
