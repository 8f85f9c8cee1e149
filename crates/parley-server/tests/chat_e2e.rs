use std::{
    io::{Read, Write},
    net::TcpStream,
    thread,
    time::{Duration, Instant},
};

use parley_server::{ChatServer, ServerConfig, ServerHandle};
use parley_protocol::Splitter;

/// Binds to an ephemeral port and runs the reactor on its own thread.
fn start_server() -> (ServerHandle, thread::JoinHandle<()>) {
    let (mut server, handle) =
        ChatServer::bind(ServerConfig { port: 0, ..ServerConfig::default() })
            .expect("failed to bind server");
    let join = thread::spawn(move || server.run().expect("server loop failed"));
    (handle, join)
}

/// A raw wire-level chat peer: a blocking stream plus its own splitter.
struct Peer {
    stream: TcpStream,
    splitter: Splitter,
}

impl Peer {
    fn connect(handle: &ServerHandle) -> Self {
        let stream = TcpStream::connect(handle.local_addr()).expect("failed to connect");
        stream
            .set_read_timeout(Some(Duration::from_millis(50)))
            .expect("failed to set read timeout");
        Self { stream, splitter: Splitter::new() }
    }

    fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("send failed");
        self.stream.flush().expect("flush failed");
    }

    /// Collects `n` payloads or panics at the deadline.
    fn recv_payloads(&mut self, n: usize) -> Vec<String> {
        let mut out = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut buf = [0_u8; 4096];

        while out.len() < n {
            if let Some(payload) = self.splitter.next_payload() {
                out.push(payload);
                continue;
            }
            assert!(Instant::now() < deadline, "timed out after {} of {n} payloads", out.len());
            match self.stream.read(&mut buf) {
                Ok(0) => break,
                Ok(read) => self.splitter.append(&buf[..read]).expect("malformed frame"),
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock ||
                        e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(err) => panic!("read failed: {err}"),
            }
        }
        out
    }

    /// True once the server has closed this connection.
    fn closed_by_server(&mut self) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut buf = [0_u8; 4096];
        while Instant::now() < deadline {
            match self.stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(read) => {
                    if self.splitter.append(&buf[..read]).is_err() {
                        return true;
                    }
                }
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock ||
                        e.kind() == std::io::ErrorKind::TimedOut => {}
                // Reset also counts: unread data at close elicits one.
                Err(_) => return true,
            }
        }
        false
    }
}

#[test]
fn join_say_leave() {
    let (handle, join) = start_server();

    let mut ann = Peer::connect(&handle);
    ann.send(b"9##USER$$ann");
    assert_eq!(ann.recv_payloads(1), ["BROADCAST$$ann joined conversation."]);

    ann.send(b"9##ENTRY$$hi");
    assert_eq!(ann.recv_payloads(1), ["BROADCAST$$ann: hi"]);

    // The leaver is removed before the leave broadcast fans out, so only
    // the observer sees it.
    let mut observer = Peer::connect(&handle);
    assert_eq!(observer.recv_payloads(2).len(), 2);

    ann.send(b"10##DISCONNECT");
    assert_eq!(observer.recv_payloads(1), ["BROADCAST$$ann left conversation."]);

    handle.shutdown();
    join.join().unwrap();
}

#[test]
fn exact_wire_bytes_for_join() {
    let (handle, join) = start_server();

    let mut ann = Peer::connect(&handle);
    ann.send(b"9##USER$$ann");

    let expected = b"35##BROADCAST$$ann joined conversation.";
    let mut got = vec![0_u8; expected.len()];
    ann.stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("failed to set read timeout");
    ann.stream.read_exact(&mut got).expect("read failed");
    assert_eq!(got, expected);

    handle.shutdown();
    join.join().unwrap();
}

#[test]
fn replay_precedes_live_traffic() {
    let (handle, join) = start_server();

    let mut ann = Peer::connect(&handle);
    ann.send(b"9##USER$$ann9##ENTRY$$hi");
    assert_eq!(
        ann.recv_payloads(2),
        ["BROADCAST$$ann joined conversation.", "BROADCAST$$ann: hi"]
    );

    // Bob joins late: the retained history arrives first, in order, then
    // his own join.
    let mut bob = Peer::connect(&handle);
    bob.send(b"9##USER$$bob");
    assert_eq!(
        bob.recv_payloads(3),
        [
            "BROADCAST$$ann joined conversation.",
            "BROADCAST$$ann: hi",
            "BROADCAST$$bob joined conversation.",
        ]
    );

    handle.shutdown();
    join.join().unwrap();
}

#[test]
fn frame_split_across_segments() {
    let (handle, join) = start_server();

    let mut eve = Peer::connect(&handle);
    eve.send(b"9##USE");
    thread::sleep(Duration::from_millis(100));
    eve.send(b"R$$eve");

    assert_eq!(eve.recv_payloads(1), ["BROADCAST$$eve joined conversation."]);

    handle.shutdown();
    join.join().unwrap();
}

#[test]
fn two_frames_in_one_segment() {
    let (handle, join) = start_server();

    let mut ann = Peer::connect(&handle);
    ann.send(b"9##USER$$ann9##ENTRY$$hi");
    assert_eq!(
        ann.recv_payloads(2),
        ["BROADCAST$$ann joined conversation.", "BROADCAST$$ann: hi"]
    );

    handle.shutdown();
    join.join().unwrap();
}

#[test]
fn malformed_length_isolates_offender() {
    let (handle, join) = start_server();

    let mut ann = Peer::connect(&handle);
    ann.send(b"9##USER$$ann");
    assert_eq!(ann.recv_payloads(1).len(), 1);

    let mut mallory = Peer::connect(&handle);
    mallory.send(b"abc##USER$$x");
    assert!(mallory.closed_by_server(), "offender was not dropped");

    // The violation left everyone else untouched.
    ann.send(b"15##ENTRY$$still on");
    assert_eq!(ann.recv_payloads(1), ["BROADCAST$$ann: still on"]);

    handle.shutdown();
    join.join().unwrap();
}

#[test]
fn unknown_kind_isolates_offender() {
    let (handle, join) = start_server();

    let mut mallory = Peer::connect(&handle);
    mallory.send(b"8##SPAM$$hi");
    assert!(mallory.closed_by_server(), "offender was not dropped");

    handle.shutdown();
    join.join().unwrap();
}

#[test]
fn broadcast_fans_out_to_every_client_in_order() {
    let (handle, join) = start_server();

    let mut peers: Vec<Peer> = (0..4).map(|_| Peer::connect(&handle)).collect();
    // Make sure every peer is registered before the burst.
    for (i, peer) in peers.iter_mut().enumerate() {
        peer.send(format!("11##USER$$peer{i}").as_bytes());
    }
    for peer in &mut peers {
        assert_eq!(peer.recv_payloads(4).len(), 4);
    }

    for seq in 0..20 {
        handle.broadcast(format!("message {seq}"));
    }

    for peer in &mut peers {
        let got = peer.recv_payloads(20);
        let expected: Vec<String> =
            (0..20).map(|seq| format!("BROADCAST$$message {seq}")).collect();
        assert_eq!(got, expected);
    }

    handle.shutdown();
    join.join().unwrap();
}
