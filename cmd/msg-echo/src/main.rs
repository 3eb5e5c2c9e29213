//! Message echo server
//!
//! Accepts TCP clients and UDP datagrams on the same port. `PING` is
//! answered with `PONG`, `QUIT` with `BYE` (and the client is closed),
//! anything else with `ECHO`; replies carry the request's parameters.
//! `STOP`, SIGINT or SIGTERM stops the server.
//!
//! Usage:
//!     msg-echo [port] [udp_secret]
//!
//! Test with:
//!     echo 'PING n=1' | nc -q1 localhost 7600
//!     msg-send tcp 127.0.0.1 7600 'PING n=1'
//!     msg-send udp 127.0.0.1 7600 STOP
//!
//! # Environment Variables
//!
//! - `POLLCOMM_LOG=debug` - log filter, or `POLLCOMM_LOG_LEVEL=4`
//! - `POLLCOMM_EVENT_LIMIT`, `POLLCOMM_UDP_MAX_DATAGRAM`, ... - reactor tuning

use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::Rc;

use nix::sys::signal::Signal;
use pollcomm::prelude::*;

fn echo_of(message: &Message) -> CommResult<Message> {
    let command = match message.command() {
        "PING" => "PONG",
        "QUIT" | "STOP" => "BYE",
        _ => "ECHO",
    };
    let mut reply = Message::new(command)?;
    reply.reply_to(message);
    for (name, value) in message.parameters() {
        reply.add_parameter(name, value)?;
    }
    Ok(reply)
}

/// Remove every connection that is not running right now.
fn shutdown(comm: &Communicator) {
    for conn in comm.connections() {
        let id = match conn.try_borrow() {
            Ok(c) => c.base().id(),
            Err(_) => continue,
        };
        comm.remove_connection(id);
    }
}

fn stop_on(comm: &Communicator, signal: Signal, served: Rc<Cell<u64>>) -> CommResult<()> {
    let conn = SignalConnection::new(
        comm.signals(),
        signal,
        move |base: &mut ConnectionBase, info: &SignalInfo, comm: &Communicator| {
            tracing::info!(signo = info.signo, served = served.get(), "stopping");
            shutdown(comm);
            base.mark_done();
        },
    )?;
    comm.add(conn)?;
    Ok(())
}

fn run(port: u16, secret: Option<String>) -> CommResult<()> {
    let comm = Communicator::new();
    let served = Rc::new(Cell::new(0u64));

    stop_on(&comm, Signal::SIGINT, served.clone())?;
    stop_on(&comm, Signal::SIGTERM, served.clone())?;

    let s = served.clone();
    let server = TcpServerConnection::bind(
        "0.0.0.0",
        port,
        TcpServerOptions::default(),
        move |_: &mut ConnectionBase, client: TcpServerClient, comm: &Communicator| {
            let peer = client.client_addr_port();
            let s = s.clone();
            let echo = TcpServerClientMessageConnection::with_messages(
                client,
                move |core: &mut BufferCore<TcpServerClient>, message: Message, comm: &Communicator| {
                    s.set(s.get() + 1);
                    let sent = echo_of(&message).and_then(|reply| core.send_message(&reply));
                    if let Err(e) = sent {
                        tracing::warn!(error = %e, "reply failed");
                    }
                    match message.command() {
                        "QUIT" => core.mark_done(),
                        "STOP" => {
                            tracing::info!(served = s.get(), "stop requested");
                            core.mark_done();
                            shutdown(comm);
                        }
                        _ => {}
                    }
                },
            );
            match comm.add(echo) {
                Ok(_) => tracing::info!(%peer, "client connected"),
                Err(e) => tracing::warn!(%peer, error = %e, "client rejected"),
            }
        },
    )?;
    let local = server.local_addr();
    comm.add(server)?;

    let s = served.clone();
    let udp = UdpMessageConnection::with_messages(
        "0.0.0.0",
        local.port(),
        secret,
        move |base: &mut ConnectionBase, message: Message, from: SocketAddr, comm: &Communicator| {
            s.set(s.get() + 1);
            tracing::info!(%from, command = message.command(), "datagram");
            if message.command() == "STOP" {
                tracing::info!(served = s.get(), "stop requested");
                base.mark_done();
                shutdown(comm);
            }
        },
    )?;
    comm.add(udp)?;

    tracing::info!(addr = %local, "msg-echo listening (tcp + udp)");
    comm.run()
}

fn main() {
    pollcomm::init_logging();
    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(7600);
    let secret = args.get(2).cloned();

    if let Err(e) = run(port, secret) {
        tracing::error!(error = %e, "msg-echo failed");
        std::process::exit(1);
    }
}
