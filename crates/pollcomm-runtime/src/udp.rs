//! UDP family
//!
//! A datagram carries exactly one message without a trailing newline.
//! Datagrams are capped (1024 bytes by default); sending a larger message
//! fails instead of being truncated.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};

use pollcomm_core::config::defaults;
use pollcomm_core::Message;

use crate::communicator::Communicator;
use crate::connection::{Connection, ConnectionBase};
use crate::error::{CommError, CommResult};
use crate::tcp::resolve;

/// Parameter carrying the shared secret.
pub const UDP_SECRET_PARAMETER: &str = "udp_secret";

/// Send `message` as one datagram from a short-lived socket.
///
/// With a `secret`, the `udp_secret` parameter is added first.
pub fn send_message(addr: &str, port: u16, message: &Message, secret: Option<&str>) -> CommResult<()> {
    send_message_limit(addr, port, message, secret, defaults::UDP_MAX_DATAGRAM)
}

/// Same as [`send_message`] with an explicit datagram ceiling.
pub fn send_message_limit(
    addr: &str,
    port: u16,
    message: &Message,
    secret: Option<&str>,
    max: usize,
) -> CommResult<()> {
    let text = match secret {
        Some(secret) => {
            let mut signed = message.clone();
            signed.add_parameter(UDP_SECRET_PARAMETER, secret)?;
            signed.to_message()?
        }
        None => message.to_message()?,
    };
    if text.len() > max {
        return Err(CommError::MessageTooLarge { size: text.len(), max });
    }

    let target = resolve(addr, port)?;
    let local = match target {
        SocketAddr::V4(_) => "0.0.0.0:0",
        SocketAddr::V6(_) => "[::]:0",
    };
    let socket = UdpSocket::bind(local)?;
    let sent = socket.send_to(text.as_bytes(), target)?;
    if sent != text.len() {
        return Err(CommError::Io(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("datagram truncated to {} of {} bytes", sent, text.len()),
        )));
    }
    tracing::trace!(%target, size = sent, "udp message sent");
    Ok(())
}

pub trait DatagramHandler {
    fn on_datagram(&mut self, base: &mut ConnectionBase, data: &[u8], from: SocketAddr, comm: &Communicator);
}

impl<F> DatagramHandler for F
where
    F: FnMut(&mut ConnectionBase, &[u8], SocketAddr, &Communicator),
{
    fn on_datagram(&mut self, base: &mut ConnectionBase, data: &[u8], from: SocketAddr, comm: &Communicator) {
        self(base, data, from, comm)
    }
}

/// Bound datagram socket; drains every pending datagram per readiness.
pub struct UdpServerConnection<H> {
    base: ConnectionBase,
    socket: Option<UdpSocket>,
    local: SocketAddr,
    max_datagram: usize,
    handler: H,
}

impl<H: DatagramHandler> UdpServerConnection<H> {
    /// Bind `addr:port` (port 0 picks a free one).
    pub fn bind(addr: &str, port: u16, handler: H) -> CommResult<Self> {
        let socket = UdpSocket::bind(resolve(addr, port)?)?;
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        tracing::info!(addr = %local, "udp server listening");
        Ok(Self {
            base: ConnectionBase::new(format!("udp server {}", local)),
            socket: Some(socket),
            local,
            max_datagram: defaults::UDP_MAX_DATAGRAM,
            handler,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn max_datagram(&self) -> usize {
        self.max_datagram
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn close(&mut self) {
        self.socket = None;
    }
}

impl<H: DatagramHandler> Connection for UdpServerConnection<H> {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ConnectionBase {
        &mut self.base
    }

    fn socket(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|s| s.as_raw_fd())
    }

    fn is_reader(&self) -> bool {
        true
    }

    fn on_read_ready(&mut self, comm: &Communicator) {
        // one spare byte to detect oversized datagrams
        let mut buf = vec![0u8; self.max_datagram + 1];
        loop {
            let Some(socket) = self.socket.as_ref() else {
                return;
            };
            let (size, from) = match socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(connection = %self.base.name(), error = %e, "recv failed");
                    return;
                }
            };
            if size > self.max_datagram {
                tracing::warn!(%from, max = self.max_datagram, "dropping oversized datagram");
                continue;
            }
            self.handler.on_datagram(&mut self.base, &buf[..size], from, comm);
        }
    }

    fn on_added(&mut self, comm: &Communicator) {
        self.max_datagram = comm.config().udp_max_datagram;
    }

    fn on_removed(&mut self, _comm: &Communicator) {
        self.close();
    }
}

pub trait UdpMessageHandler {
    fn process_message(&mut self, base: &mut ConnectionBase, message: Message, from: SocketAddr, comm: &Communicator);
}

impl<F> UdpMessageHandler for F
where
    F: FnMut(&mut ConnectionBase, Message, SocketAddr, &Communicator),
{
    fn process_message(&mut self, base: &mut ConnectionBase, message: Message, from: SocketAddr, comm: &Communicator) {
        self(base, message, from, comm)
    }
}

/// Adapter parsing each datagram, checking the optional shared secret.
pub struct UdpMessages<H> {
    secret: Option<String>,
    handler: H,
}

impl<H: UdpMessageHandler> DatagramHandler for UdpMessages<H> {
    fn on_datagram(&mut self, base: &mut ConnectionBase, data: &[u8], from: SocketAddr, comm: &Communicator) {
        let Ok(text) = std::str::from_utf8(data) else {
            tracing::warn!(%from, "dropping non UTF-8 datagram");
            return;
        };
        let mut message = match Message::parse(text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(%from, error = %e, datagram = text, "dropping malformed message");
                return;
            }
        };
        if let Some(secret) = &self.secret {
            if message.get_parameter(UDP_SECRET_PARAMETER).ok() != Some(secret.as_str()) {
                tracing::warn!(%from, command = message.command(), "dropping message with a bad udp secret");
                return;
            }
        }
        message.remove_parameter(UDP_SECRET_PARAMETER);
        self.handler.process_message(base, message, from, comm);
    }
}

pub type UdpMessageConnection<H> = UdpServerConnection<UdpMessages<H>>;

impl<H: UdpMessageHandler> UdpServerConnection<UdpMessages<H>> {
    /// Bind a message listener. With a `secret`, datagrams whose
    /// `udp_secret` parameter differs are dropped.
    pub fn with_messages(addr: &str, port: u16, secret: Option<String>, handler: H) -> CommResult<Self> {
        Self::bind(addr, port, UdpMessages { secret, handler })
    }

    /// Send a message, signed with this listener's secret.
    pub fn send(&self, addr: &str, port: u16, message: &Message) -> CommResult<()> {
        send_message_limit(addr, port, message, self.handler.secret.as_deref(), self.max_datagram)
    }

    pub fn message_handler_mut(&mut self) -> &mut H {
        &mut self.handler.handler
    }
}
