//! Send one message
//!
//! `tcp`: connect, send, print every reply until `BYE`, or only the first
//! reply with `--one`. `udp`: send one datagram (signed when a secret is
//! given) and exit.
//!
//! Usage:
//!     msg-send tcp <host> <port> <message> [--one] [--timeout ms]
//!     msg-send udp <host> <port> <message> [secret]
//!
//! Examples:
//!     msg-send tcp 127.0.0.1 7600 'PING n=1' --one
//!     msg-send tcp 127.0.0.1 7600 QUIT
//!     msg-send udp 127.0.0.1 7600 'NOTE text="hello there"' s3cret

use pollcomm::blocking::BlockingMessageConnection;
use pollcomm::prelude::*;

#[derive(Debug, Default)]
struct Options {
    host: String,
    port: u16,
    message: String,
    udp: bool,
    secret: Option<String>,
    one: bool,
    timeout_ms: i64,
}

fn usage() -> ! {
    eprintln!("usage: msg-send tcp <host> <port> <message> [--one] [--timeout ms]");
    eprintln!("       msg-send udp <host> <port> <message> [secret]");
    std::process::exit(2);
}

fn parse_args() -> Options {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 4 {
        usage();
    }
    let mut opts = Options {
        udp: match args[0].as_str() {
            "tcp" => false,
            "udp" => true,
            _ => usage(),
        },
        host: args[1].clone(),
        port: args[2].parse().unwrap_or_else(|_| usage()),
        message: args[3].clone(),
        timeout_ms: 5_000,
        ..Default::default()
    };
    let mut rest = args[4..].iter();
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--one" if !opts.udp => opts.one = true,
            "--timeout" if !opts.udp => {
                opts.timeout_ms = rest
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| usage());
            }
            secret if opts.udp && opts.secret.is_none() => opts.secret = Some(secret.to_string()),
            _ => usage(),
        }
    }
    opts
}

fn run(opts: &Options) -> CommResult<()> {
    let message = Message::parse(&opts.message)?;

    if opts.udp {
        pollcomm::udp::send_message(&opts.host, opts.port, &message, opts.secret.as_deref())?;
        tracing::info!(host = %opts.host, port = opts.port, "datagram sent");
        return Ok(());
    }

    let mut client = BlockingMessageConnection::connect(&opts.host, opts.port)?;
    if opts.timeout_ms > 0 {
        let deadline = pollcomm::current_date_us() + opts.timeout_ms * 1000;
        client.base_mut().set_timeout_date(deadline)?;
    }
    if !client.send_message(&message) {
        return Err(CommError::SocketError(client.peer_addr().to_string()));
    }

    let one = opts.one;
    client.run(&mut |link: &mut dyn MessageSender, reply: Message| {
        match reply.to_message() {
            Ok(text) => println!("{}", text),
            Err(e) => tracing::warn!(error = %e, "unprintable reply"),
        }
        if one || reply.command() == "BYE" {
            link.mark_done();
        }
    })
}

fn main() {
    pollcomm::init_logging();
    let opts = parse_args();
    if let Err(e) = run(&opts) {
        tracing::error!(error = %e, "msg-send failed");
        std::process::exit(1);
    }
}
