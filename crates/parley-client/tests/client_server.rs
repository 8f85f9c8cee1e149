use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use parley_client::{ChatClient, ClientError, CommunicationListener};
use parley_server::{ChatServer, ServerConfig, ServerHandle};

fn start_server() -> (ServerHandle, thread::JoinHandle<()>) {
    let (mut server, handle) =
        ChatServer::bind(ServerConfig { port: 0, ..ServerConfig::default() })
            .expect("failed to bind server");
    let join = thread::spawn(move || server.run().expect("server loop failed"));
    (handle, join)
}

fn connected_client(handle: &ServerHandle, listener: Arc<Recorder>) -> ChatClient {
    let client = ChatClient::new();
    client.add_communication_listener(listener);
    client
        .connect("127.0.0.1", handle.local_addr().port())
        .expect("connect failed");
    client
}

/// Records every callback in dispatch order.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn snapshot(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Blocks until the recorded events satisfy `pred` or panics at the
    /// deadline.
    fn wait_until(&self, what: &str, pred: impl Fn(&[String]) -> bool) -> Vec<String> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let events = self.snapshot();
            if pred(&events) {
                return events;
            }
            assert!(Instant::now() < deadline, "timed out waiting for {what}: {events:?}");
            thread::sleep(Duration::from_millis(10));
        }
    }
}

impl CommunicationListener for Recorder {
    fn connected(&self, _addr: SocketAddr) {
        self.events.lock().unwrap().push("connected".to_owned());
    }

    fn disconnected(&self) {
        self.events.lock().unwrap().push("disconnected".to_owned());
    }

    fn recvd_msg(&self, body: String) {
        self.events.lock().unwrap().push(format!("msg:{body}"));
    }
}

#[test]
fn callback_sequence_is_ordered() {
    let (handle, join) = start_server();

    let recorder = Arc::new(Recorder::default());
    let client = connected_client(&handle, Arc::clone(&recorder));

    client.send_username("ann").expect("send failed");
    recorder.wait_until("join broadcast", |evs| {
        evs.contains(&"msg:ann joined conversation.".to_owned())
    });

    client.send_chat_entry("hi").expect("send failed");
    recorder.wait_until("entry broadcast", |evs| evs.contains(&"msg:ann: hi".to_owned()));

    client.disconnect();
    let events = recorder.wait_until("disconnect callback", |evs| {
        evs.last().is_some_and(|ev| ev == "disconnected")
    });

    // `connected` strictly precedes the first message, `disconnected` is
    // final and fires exactly once.
    assert_eq!(events.first().map(String::as_str), Some("connected"));
    assert_eq!(events.iter().filter(|ev| *ev == "disconnected").count(), 1);
    assert_eq!(
        events[1..events.len() - 1],
        ["msg:ann joined conversation.".to_owned(), "msg:ann: hi".to_owned()]
    );

    handle.shutdown();
    join.join().unwrap();
}

#[test]
fn two_clients_converse_and_late_joiner_gets_replay() {
    let (handle, join) = start_server();

    let ann_rec = Arc::new(Recorder::default());
    let ann = connected_client(&handle, Arc::clone(&ann_rec));
    ann.send_username("ann").expect("send failed");
    ann.send_chat_entry("anyone here?").expect("send failed");
    ann_rec.wait_until("ann's own entry", |evs| {
        evs.contains(&"msg:ann: anyone here?".to_owned())
    });

    // Bob joins late and must see the retained history first, in order.
    let bob_rec = Arc::new(Recorder::default());
    let bob = connected_client(&handle, Arc::clone(&bob_rec));
    bob.send_username("bob").expect("send failed");
    let bob_events = bob_rec.wait_until("bob's join", |evs| {
        evs.contains(&"msg:bob joined conversation.".to_owned())
    });
    assert_eq!(
        bob_events,
        [
            "connected".to_owned(),
            "msg:ann joined conversation.".to_owned(),
            "msg:ann: anyone here?".to_owned(),
            "msg:bob joined conversation.".to_owned(),
        ]
    );

    // Both sides observe bob's reply.
    bob.send_chat_entry("hi ann").expect("send failed");
    ann_rec.wait_until("bob's entry at ann", |evs| evs.contains(&"msg:bob: hi ann".to_owned()));
    bob_rec.wait_until("bob's entry at bob", |evs| evs.contains(&"msg:bob: hi ann".to_owned()));

    // Bob leaving is announced to ann only.
    bob.disconnect();
    ann_rec.wait_until("bob's leave at ann", |evs| {
        evs.contains(&"msg:bob left conversation.".to_owned())
    });

    handle.shutdown();
    join.join().unwrap();
}

#[test]
fn delimiters_are_rejected_at_the_send_api() {
    let (handle, join) = start_server();

    let recorder = Arc::new(Recorder::default());
    let client = connected_client(&handle, Arc::clone(&recorder));

    assert!(matches!(
        client.send_chat_entry("sneaky##frame"),
        Err(ClientError::Protocol(_))
    ));
    assert!(matches!(
        client.send_username("sneaky$$name"),
        Err(ClientError::Protocol(_))
    ));

    handle.shutdown();
    join.join().unwrap();
}

#[test]
fn connect_twice_fails() {
    let (handle, join) = start_server();

    let client = ChatClient::new();
    let port = handle.local_addr().port();
    client.connect("127.0.0.1", port).expect("connect failed");
    assert!(matches!(
        client.connect("127.0.0.1", port),
        Err(ClientError::AlreadyConnected)
    ));

    handle.shutdown();
    join.join().unwrap();
}

#[test]
fn send_after_disconnect_fails() {
    let (handle, join) = start_server();

    let client = ChatClient::new();
    client
        .connect("127.0.0.1", handle.local_addr().port())
        .expect("connect failed");
    client.disconnect();
    assert!(matches!(client.send_chat_entry("too late"), Err(ClientError::NotConnected)));

    handle.shutdown();
    join.join().unwrap();
}

#[test]
fn server_shutdown_dispatches_disconnected() {
    let (handle, join) = start_server();

    let recorder = Arc::new(Recorder::default());
    let client = connected_client(&handle, Arc::clone(&recorder));
    recorder.wait_until("connect callback", |evs| !evs.is_empty());

    handle.shutdown();
    join.join().unwrap();

    recorder.wait_until("disconnect callback", |evs| {
        evs.last().is_some_and(|ev| ev == "disconnected")
    });
    drop(client);
}
