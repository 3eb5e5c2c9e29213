//! Message links over loopback TCP.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use pollcomm_core::config::CommConfig;
use pollcomm_core::Message;
use pollcomm_runtime::{
    BufferCore, Communicator, Connection, ConnectionBase, ConnectionId, MessageSender, PermanentConnection,
    PermanentHandler, PermanentState, TcpClient, TcpClientMessageConnection, TcpServerClient,
    TcpServerClientMessageConnection, TcpServerConnection, TcpServerOptions, TimerConnection,
};
use pretty_assertions::assert_eq;

type Stop = Rc<Cell<Option<ConnectionId>>>;

/// Listener whose clients echo every message back as `ECHO`, answer
/// `QUIT` with `BYE`, and shut the listener down on `QUIT`.
fn echo_server(comm: &Communicator) -> u16 {
    let listener: Stop = Rc::new(Cell::new(None));
    let l = listener.clone();
    let server = TcpServerConnection::bind(
        "127.0.0.1",
        0,
        TcpServerOptions::default(),
        move |_: &mut ConnectionBase, client: TcpServerClient, comm: &Communicator| {
            let l = l.clone();
            let echo = TcpServerClientMessageConnection::with_messages(
                client,
                move |core: &mut BufferCore<TcpServerClient>, message: Message, comm: &Communicator| {
                    let command = if message.command() == "QUIT" { "BYE" } else { "ECHO" };
                    let mut reply = Message::new(command).unwrap();
                    reply.reply_to(&message);
                    for (name, value) in message.parameters() {
                        reply.add_parameter(name, value).unwrap();
                    }
                    core.send_message(&reply).unwrap();
                    if command == "BYE" {
                        core.mark_done();
                        if let Some(id) = l.take() {
                            comm.remove_connection(id);
                        }
                    }
                },
            );
            comm.add(echo).unwrap();
        },
    )
    .unwrap();
    let port = server.local_addr().port();
    listener.set(Some(server.base().id()));
    comm.add(server).unwrap();
    port
}

#[test]
fn test_echo_round_trip() {
    let comm = Communicator::with_config(CommConfig::new());
    let port = echo_server(&comm);

    let got = Rc::new(RefCell::new(Vec::new()));
    let g = got.clone();
    let mut client = TcpClientMessageConnection::with_messages(
        TcpClient::connect("127.0.0.1", port).unwrap(),
        move |core: &mut BufferCore<TcpClient>, message: Message, _: &Communicator| {
            let n = message.get_parameter("text").unwrap_or("-").to_string();
            g.borrow_mut().push(format!("{} {}", message.command(), n));
            if message.command() == "BYE" {
                core.mark_done();
            }
        },
    );
    for text in ["a b", "semi;colon", "\"quoted\""] {
        let mut m = Message::new("SAY").unwrap();
        m.add_parameter("text", text).unwrap();
        client.send_message(&m).unwrap();
    }
    client.send_message(&Message::new("QUIT").unwrap()).unwrap();
    comm.add(client).unwrap();

    comm.run().unwrap();
    assert_eq!(
        *got.borrow(),
        vec!["ECHO a b", "ECHO semi;colon", "ECHO \"quoted\"", "BYE -"]
    );
    assert_eq!(comm.connection_count(), 0);
}

#[derive(Default)]
struct Tracker {
    states: Vec<PermanentState>,
    replies: Vec<String>,
    connected: u32,
    stop: Stop,
}

impl PermanentHandler for Tracker {
    fn process_message(&mut self, link: &mut dyn MessageSender, message: Message, comm: &Communicator) {
        self.replies.push(message.command().to_string());
        match message.command() {
            "ECHO" => link.send_message(&Message::new("QUIT").unwrap()).unwrap(),
            "BYE" => {
                if let Some(id) = self.stop.take() {
                    comm.remove_connection(id);
                }
            }
            _ => {}
        }
    }

    fn process_connected(&mut self, _link: &mut dyn MessageSender, _comm: &Communicator) {
        self.connected += 1;
    }

    fn on_state_change(&mut self, _from: PermanentState, to: PermanentState) {
        self.states.push(to);
    }
}

fn run_permanent(use_thread: bool) {
    let comm = Communicator::with_config(CommConfig::new());
    let port = echo_server(&comm);

    let stop: Stop = Rc::new(Cell::new(None));
    let client = PermanentConnection::new(
        "127.0.0.1",
        port,
        Tracker {
            stop: stop.clone(),
            ..Default::default()
        },
    );
    {
        let mut c = client.borrow_mut();
        c.set_pause(-1_000_000);
        c.set_use_thread(use_thread);
        c.send(&Message::new("HELLO").unwrap(), true).unwrap();
        assert_eq!(c.cache_size(), 1);
        stop.set(Some(c.base().id()));
    }
    comm.add_connection(client.clone()).unwrap();
    comm.run().unwrap();

    let c = client.borrow();
    assert_eq!(c.state(), PermanentState::Done);
    assert_eq!(c.cache_size(), 0);
    let handler = c.handler();
    let tracker = handler.borrow();
    assert_eq!(tracker.connected, 1);
    assert_eq!(tracker.replies, vec!["ECHO", "BYE"]);
    // the final change to Done happens while the handler is running, so
    // it is not reported back to it
    assert_eq!(
        &tracker.states[..2],
        &[PermanentState::Connecting, PermanentState::Connected]
    );
}

#[test]
fn test_permanent_flushes_cache_inline() {
    run_permanent(false);
}

#[test]
fn test_permanent_flushes_cache_on_worker() {
    run_permanent(true);
}

#[derive(Default)]
struct Reconnects {
    states: Vec<PermanentState>,
    replies: Vec<String>,
    connected: u32,
    disconnected: u32,
    stop: Stop,
}

impl PermanentHandler for Reconnects {
    fn process_message(&mut self, _link: &mut dyn MessageSender, message: Message, comm: &Communicator) {
        self.replies.push(message.command().to_string());
        if message.command() == "BYE" {
            if let Some(id) = self.stop.take() {
                comm.remove_connection(id);
            }
        }
    }

    fn process_connected(&mut self, link: &mut dyn MessageSender, _comm: &Communicator) {
        self.connected += 1;
        link.send_message(&Message::new("HELLO").unwrap()).unwrap();
    }

    fn process_disconnected(&mut self, _comm: &Communicator) {
        self.disconnected += 1;
    }

    fn on_state_change(&mut self, _from: PermanentState, to: PermanentState) {
        self.states.push(to);
    }
}

#[test]
fn test_permanent_reconnects_after_hangup() {
    let comm = Communicator::with_config(CommConfig::new());

    // first HELLO: answer DROP and close; second HELLO: answer BYE
    let hellos = Rc::new(Cell::new(0));
    let listener: Stop = Rc::new(Cell::new(None));
    let l = listener.clone();
    let server = TcpServerConnection::bind(
        "127.0.0.1",
        0,
        TcpServerOptions::default(),
        move |_: &mut ConnectionBase, client: TcpServerClient, comm: &Communicator| {
            let hellos = hellos.clone();
            let l = l.clone();
            let conn = TcpServerClientMessageConnection::with_messages(
                client,
                move |core: &mut BufferCore<TcpServerClient>, message: Message, comm: &Communicator| {
                    assert_eq!(message.command(), "HELLO");
                    hellos.set(hellos.get() + 1);
                    let command = if hellos.get() == 1 { "DROP" } else { "BYE" };
                    core.send_message(&Message::new(command).unwrap()).unwrap();
                    core.mark_done();
                    if command == "BYE" {
                        if let Some(id) = l.take() {
                            comm.remove_connection(id);
                        }
                    }
                },
            );
            comm.add(conn).unwrap();
        },
    )
    .unwrap();
    let port = server.local_addr().port();
    listener.set(Some(server.base().id()));
    comm.add(server).unwrap();

    let stop: Stop = Rc::new(Cell::new(None));
    let client = PermanentConnection::new(
        "127.0.0.1",
        port,
        Reconnects {
            stop: stop.clone(),
            ..Default::default()
        },
    );
    {
        let mut c = client.borrow_mut();
        c.set_pause(-20_000);
        c.set_use_thread(false);
        stop.set(Some(c.base().id()));
    }
    comm.add_connection(client.clone()).unwrap();
    comm.run().unwrap();

    let c = client.borrow();
    assert_eq!(c.state(), PermanentState::Done);
    let handler = c.handler();
    let record = handler.borrow();
    assert_eq!(record.replies, vec!["DROP", "BYE"]);
    assert_eq!(record.connected, 2);
    assert_eq!(record.disconnected, 1);
    assert_eq!(
        &record.states[..5],
        &[
            PermanentState::Connecting,
            PermanentState::Connected,
            PermanentState::Disconnected,
            PermanentState::Connecting,
            PermanentState::Connected,
        ]
    );
}

#[test]
fn test_permanent_mark_done_flushes_then_stops() {
    let comm = Communicator::with_config(CommConfig::new());

    let received = Rc::new(RefCell::new(Vec::new()));
    let r = received.clone();
    let listener: Stop = Rc::new(Cell::new(None));
    let l = listener.clone();
    let server = TcpServerConnection::bind(
        "127.0.0.1",
        0,
        TcpServerOptions::default(),
        move |_: &mut ConnectionBase, client: TcpServerClient, comm: &Communicator| {
            let r = r.clone();
            let l = l.clone();
            let conn = TcpServerClientMessageConnection::with_messages(
                client,
                move |_: &mut BufferCore<TcpServerClient>, message: Message, comm: &Communicator| {
                    r.borrow_mut().push(message.command().to_string());
                    if let Some(id) = l.take() {
                        comm.remove_connection(id);
                    }
                },
            );
            comm.add(conn).unwrap();
        },
    )
    .unwrap();
    let port = server.local_addr().port();
    listener.set(Some(server.base().id()));
    comm.add(server).unwrap();

    let client = PermanentConnection::new("127.0.0.1", port, Reconnects::default());
    {
        let mut c = client.borrow_mut();
        c.set_pause(-20_000);
        c.set_use_thread(false);
    }
    comm.add_connection(client.clone()).unwrap();

    // once the link is up, queue a last message and finish
    let c = client.clone();
    comm.add(
        TimerConnection::new(5_000, move |base: &mut ConnectionBase, _: &Communicator| {
            if !c.borrow().is_connected() {
                return;
            }
            c.borrow().send(&Message::new("LAST").unwrap(), false).unwrap();
            c.borrow_mut().mark_done();
            base.mark_done();
        })
        .unwrap(),
    )
    .unwrap();

    comm.run().unwrap();

    assert_eq!(*received.borrow(), vec!["HELLO", "LAST"]);
    let c = client.borrow();
    assert_eq!(c.state(), PermanentState::Done);
    let handler = c.handler();
    let record = handler.borrow();
    assert_eq!(record.connected, 1);
    assert_eq!(record.disconnected, 0);
    assert_eq!(
        record.states,
        vec![PermanentState::Connecting, PermanentState::Connected, PermanentState::Done]
    );
}
