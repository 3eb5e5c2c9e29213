use std::cell::RefCell;
use std::net::{SocketAddr, UdpSocket};
use std::rc::Rc;

use pollcomm_core::config::CommConfig;
use pollcomm_core::Message;
use pollcomm_runtime::udp::send_message;
use pollcomm_runtime::{Communicator, ConnectionBase, UdpMessageConnection, UdpServerConnection};
use pretty_assertions::assert_eq;

#[test]
fn test_bad_datagrams_are_dropped() {
    let comm = Communicator::with_config(CommConfig::new().udp_max_datagram(64));
    let got = Rc::new(RefCell::new(Vec::new()));
    let g = got.clone();
    let server = UdpMessageConnection::with_messages(
        "127.0.0.1",
        0,
        None,
        move |base: &mut ConnectionBase, m: Message, from: SocketAddr, _: &Communicator| {
            g.borrow_mut().push((m.command().to_string(), m.get_integer_parameter("n").ok(), from));
            if m.command() == "STOP" {
                base.mark_done();
            }
        },
    )
    .unwrap();
    let port = server.local_addr().port();

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    let from = sender.local_addr().unwrap();
    sender.send_to(b"lowercase is not a command", ("127.0.0.1", port)).unwrap();
    sender.send_to(format!("BIG blob={}", "x".repeat(100)).as_bytes(), ("127.0.0.1", port)).unwrap();
    sender.send_to(b"COUNT n=7", ("127.0.0.1", port)).unwrap();
    sender.send_to(b"STOP", ("127.0.0.1", port)).unwrap();

    comm.add(server).unwrap();
    comm.run().unwrap();

    assert_eq!(
        *got.borrow(),
        vec![("COUNT".to_string(), Some(7), from), ("STOP".to_string(), None, from)]
    );
}

#[test]
fn test_raw_datagrams_reach_handler() {
    let comm = Communicator::with_config(CommConfig::new());
    let sizes = Rc::new(RefCell::new(Vec::new()));
    let s = sizes.clone();
    let server = UdpServerConnection::bind(
        "127.0.0.1",
        0,
        move |base: &mut ConnectionBase, data: &[u8], _: SocketAddr, _: &Communicator| {
            s.borrow_mut().push(data.len());
            if data.is_empty() {
                base.mark_done();
            }
        },
    )
    .unwrap();
    let port = server.local_addr().port();
    assert_eq!(server.max_datagram(), pollcomm_core::defaults::UDP_MAX_DATAGRAM);

    send_message("127.0.0.1", port, &Message::new("PING").unwrap(), None).unwrap();
    UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .send_to(&[], ("127.0.0.1", port))
        .unwrap();

    comm.add(server).unwrap();
    comm.run().unwrap();
    assert_eq!(*sizes.borrow(), vec![4, 0]);
}
