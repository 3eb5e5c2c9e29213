//! TCP family
//!
//! - [`TcpClient`]: outbound stream, plain or upgraded through an injected
//!   [`SecureUpgrade`].
//! - [`TcpServerConnection`]: listener; hands every accepted stream to an
//!   [`AcceptHandler`] as a [`TcpServerClient`].
//! - [`TcpServerClient`]: accepted stream with peer/local address accessors.
//!
//! Both stream types are [`Transport`]s, so they plug into the raw,
//! buffered and message layers of [`crate::stream`].

use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::communicator::Communicator;
use crate::connection::{Connection, ConnectionBase};
use crate::error::{CommError, CommResult};
use crate::stream::{BufferConnection, MessageConnection, StreamConnection, Transport};

/// Anything that reads and writes bytes over a pollable descriptor.
pub trait ByteStream: Read + Write + AsRawFd {}

impl<S: Read + Write + AsRawFd> ByteStream for S {}

/// How a secure upgrade treats the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureMode {
    /// Encrypt and verify the peer certificate.
    Secure,
    /// Encrypt even if the peer cannot be verified.
    Always,
}

/// Wraps a connected plain stream into an encrypted one.
///
/// The returned stream must stay non-blocking.
pub trait SecureUpgrade {
    fn upgrade(&self, stream: TcpStream, mode: SecureMode) -> io::Result<Box<dyn ByteStream>>;
}

/// First address `addr:port` resolves to.
pub(crate) fn resolve(addr: &str, port: u16) -> CommResult<SocketAddr> {
    (addr, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| CommError::InvalidParameter(format!("cannot resolve {}:{}", addr, port)))
}

fn not_open() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}

fn set_keepalive(fd: RawFd) -> CommResult<()> {
    let opt: libc::c_int = 1;
    let r = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if r != 0 {
        return Err(CommError::os("setsockopt(SO_KEEPALIVE)"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Outbound TCP stream.
pub struct TcpClient {
    stream: Option<Box<dyn ByteStream>>,
    peer: SocketAddr,
}

impl TcpClient {
    /// Connect (blocking), then switch the stream to non-blocking.
    pub fn connect(addr: &str, port: u16) -> CommResult<Self> {
        let (stream, peer) = Self::open(addr, port)?;
        Ok(Self {
            stream: Some(Box::new(stream)),
            peer,
        })
    }

    /// Connect and let `upgrade` wrap the stream.
    pub fn connect_secure(addr: &str, port: u16, upgrade: &dyn SecureUpgrade, mode: SecureMode) -> CommResult<Self> {
        let (stream, peer) = Self::open(addr, port)?;
        let stream = upgrade.upgrade(stream, mode)?;
        tracing::debug!(peer = %peer, ?mode, "tcp client upgraded");
        Ok(Self {
            stream: Some(stream),
            peer,
        })
    }

    fn open(addr: &str, port: u16) -> CommResult<(TcpStream, SocketAddr)> {
        let target = resolve(addr, port)?;
        let stream = TcpStream::connect(target)?;
        stream.set_nonblocking(true)?;
        let peer = stream.peer_addr().unwrap_or(target);
        tracing::debug!(%peer, fd = stream.as_raw_fd(), "tcp client connected");
        Ok((stream, peer))
    }

    pub fn addr(&self) -> IpAddr {
        self.peer.ip()
    }

    pub fn port(&self) -> u16 {
        self.peer.port()
    }

    /// `"host:port"`, or `"[v6]:port"` for IPv6.
    pub fn addr_port(&self) -> String {
        self.peer.to_string()
    }
}

impl Transport for TcpClient {
    fn fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.as_mut().ok_or_else(not_open)?.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.as_mut().ok_or_else(not_open)?.write(buf)
    }

    fn close(&mut self) {
        self.stream = None;
    }
}

pub type TcpClientConnection<H> = StreamConnection<TcpClient, H>;
pub type TcpClientBufferConnection<H> = BufferConnection<TcpClient, H>;
pub type TcpClientMessageConnection<H> = MessageConnection<TcpClient, H>;

// ---------------------------------------------------------------------------
// Server-side client
// ---------------------------------------------------------------------------

/// Stream accepted by a listener (or handed over by a connect worker).
pub struct TcpServerClient {
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
}

impl TcpServerClient {
    /// Wrap a connected stream; it is switched to non-blocking.
    pub fn new(stream: TcpStream) -> CommResult<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            peer: stream.peer_addr().ok(),
            local: stream.local_addr().ok(),
            stream: Some(stream),
        })
    }

    /// Wrap a connected socket descriptor.
    pub fn from_fd(fd: OwnedFd) -> CommResult<Self> {
        Self::new(TcpStream::from(fd))
    }

    pub fn client_addr(&self) -> Option<IpAddr> {
        self.peer.map(|a| a.ip())
    }

    pub fn client_port(&self) -> Option<u16> {
        self.peer.map(|a| a.port())
    }

    pub fn client_addr_port(&self) -> String {
        self.peer.map(|a| a.to_string()).unwrap_or_default()
    }

    pub fn server_addr(&self) -> Option<IpAddr> {
        self.local.map(|a| a.ip())
    }

    pub fn server_port(&self) -> Option<u16> {
        self.local.map(|a| a.port())
    }
}

impl Transport for TcpServerClient {
    fn fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.as_mut().ok_or_else(not_open)?.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.as_mut().ok_or_else(not_open)?.write(buf)
    }

    fn close(&mut self) {
        self.stream = None;
    }
}

pub type TcpServerClientConnection<H> = StreamConnection<TcpServerClient, H>;
pub type TcpServerClientBufferConnection<H> = BufferConnection<TcpServerClient, H>;
pub type TcpServerClientMessageConnection<H> = MessageConnection<TcpServerClient, H>;

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct TcpServerOptions {
    /// `SO_REUSEADDR` on the listening socket
    pub reuse_addr: bool,
    /// `listen(2)` backlog
    pub backlog: i32,
    /// `SO_KEEPALIVE` on accepted streams
    pub keepalive: bool,
}

impl Default for TcpServerOptions {
    fn default() -> Self {
        Self {
            reuse_addr: true,
            backlog: 128,
            keepalive: true,
        }
    }
}

pub trait AcceptHandler {
    /// A client was accepted. Register it (usually wrapped in a message
    /// connection) or drop it to close it.
    fn on_accept(&mut self, base: &mut ConnectionBase, client: TcpServerClient, comm: &Communicator);
}

impl<F> AcceptHandler for F
where
    F: FnMut(&mut ConnectionBase, TcpServerClient, &Communicator),
{
    fn on_accept(&mut self, base: &mut ConnectionBase, client: TcpServerClient, comm: &Communicator) {
        self(base, client, comm)
    }
}

pub struct TcpServerConnection<H> {
    base: ConnectionBase,
    listener: Option<TcpListener>,
    local: SocketAddr,
    keepalive: bool,
    handler: H,
}

impl<H: AcceptHandler> TcpServerConnection<H> {
    /// Bind and listen on `addr:port` (port 0 picks a free one).
    pub fn bind(addr: &str, port: u16, options: TcpServerOptions, handler: H) -> CommResult<Self> {
        let target = resolve(addr, port)?;
        let fd = bind_socket(target, &options)?;
        let listener = TcpListener::from(fd);
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, backlog = options.backlog, "tcp server listening");
        Ok(Self {
            base: ConnectionBase::new(format!("tcp server {}", local)),
            listener: Some(listener),
            local,
            keepalive: options.keepalive,
            handler,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn close(&mut self) {
        self.listener = None;
    }
}

impl<H: AcceptHandler> Connection for TcpServerConnection<H> {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ConnectionBase {
        &mut self.base
    }

    fn socket(&self) -> Option<RawFd> {
        self.listener.as_ref().map(|l| l.as_raw_fd())
    }

    fn is_listener(&self) -> bool {
        true
    }

    fn on_accept_ready(&mut self, comm: &Communicator) {
        for _ in 0..self.base.event_limit() {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };
            let stream = match listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(connection = %self.base.name(), error = %e, "accept failed");
                    return;
                }
            };
            if self.keepalive {
                if let Err(e) = set_keepalive(stream.as_raw_fd()) {
                    tracing::debug!(error = %e, "keepalive not set");
                }
            }
            match TcpServerClient::new(stream) {
                Ok(client) => {
                    tracing::debug!(client = %client.client_addr_port(), "accepted");
                    self.handler.on_accept(&mut self.base, client, comm);
                }
                Err(e) => tracing::warn!(error = %e, "cannot prepare accepted stream"),
            }
        }
    }

    fn on_removed(&mut self, _comm: &Communicator) {
        self.close();
    }
}

/// Socket setup: create, setsockopt, bind, listen.
fn bind_socket(addr: SocketAddr, options: &TcpServerOptions) -> CommResult<OwnedFd> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(CommError::os("socket"));
    }
    // Safety: fresh descriptor, closed on every error path by Drop
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    if options.reuse_addr {
        let opt: libc::c_int = 1;
        let r = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &opt as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if r != 0 {
            return Err(CommError::os("setsockopt(SO_REUSEADDR)"));
        }
    }

    let r = match addr {
        SocketAddr::V4(v4) => {
            let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            sa.sin_family = libc::AF_INET as libc::sa_family_t;
            sa.sin_port = v4.port().to_be();
            sa.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            unsafe {
                libc::bind(
                    fd.as_raw_fd(),
                    &sa as *const _ as *const libc::sockaddr,
                    std::mem::size_of_val(&sa) as libc::socklen_t,
                )
            }
        }
        SocketAddr::V6(v6) => {
            let mut sa: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sa.sin6_port = v6.port().to_be();
            sa.sin6_addr.s6_addr = v6.ip().octets();
            sa.sin6_scope_id = v6.scope_id();
            unsafe {
                libc::bind(
                    fd.as_raw_fd(),
                    &sa as *const _ as *const libc::sockaddr,
                    std::mem::size_of_val(&sa) as libc::socklen_t,
                )
            }
        }
    };
    if r != 0 {
        return Err(CommError::os("bind"));
    }

    if unsafe { libc::listen(fd.as_raw_fd(), options.backlog) } != 0 {
        return Err(CommError::os("listen"));
    }
    Ok(fd)
}
