use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use mio::{Events, Interest, Poll, Token, Waker, event::Event, net::TcpListener};
use parley_net::{ConnState, DEFAULT_OUTBOUND_WATERMARK, FramedStream, safe_panic};
use parley_protocol::{Message, MessageKind, ProtocolError, frame_payload, validate_body};
use tracing::{debug, info, warn};

use crate::conversation::Conversation;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CLIENT_TOKEN: usize = 2;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Identity of a client until its first USER message.
const ANONYMOUS: &str = "anonymous";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Retained conversation entries replayed to new joiners.
    pub history_capacity: usize,
    /// Per-connection outbound byte ceiling; a peer that falls this far
    /// behind is disconnected.
    pub outbound_watermark: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            outbound_watermark: DEFAULT_OUTBOUND_WATERMARK,
        }
    }
}

/// State shared with producer threads. The reactor owns everything else.
struct Shared {
    pending: Mutex<Vec<String>>,
    time_to_broadcast: AtomicBool,
    shutdown: AtomicBool,
    waker: Waker,
}

/// Thread-safe handle onto a running [`ChatServer`].
///
/// `broadcast` and `shutdown` may be called from any thread; both enqueue
/// their effect and wake the selector, which applies it at the top of its
/// next turn.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    /// Queues `body` for broadcast to every connected client.
    ///
    /// The push happens under the queue mutex before the flag store, so the
    /// drain that observes the flag observes the entry as well.
    pub fn broadcast(&self, body: impl Into<String>) {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(body.into());
        self.shared.time_to_broadcast.store(true, Ordering::Release);
        self.wake();
    }

    /// Asks the reactor to exit after its current turn.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.wake();
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn wake(&self) {
        if let Err(err) = self.shared.waker.wake() {
            warn!(?err, "selector wake failed");
        }
    }
}

/// One accepted connection: the framed stream plus the chosen identity.
struct Client {
    stream: FramedStream,
    username: String,
}

struct Reactor {
    poll: Poll,
    listener: TcpListener,
    clients: Vec<(Token, Client)>,
    next_token: usize,
    conversation: Conversation,
    shared: Arc<Shared>,
    config: ServerConfig,
    local_addr: SocketAddr,
}

/// Single-threaded selector loop multiplexing accept, read and write
/// readiness for every client over one `mio::Poll`.
///
/// The reactor thread exclusively owns the registration table and all
/// connection records. External threads reach it only through
/// [`ServerHandle`]: a mutex-guarded submission queue, two atomic flags and
/// the selector waker. Flags are rechecked at the top of every turn, so a
/// wake raised between the check and `poll` is never lost.
pub struct ChatServer {
    events: Events,
    inner: Reactor,
}

impl ChatServer {
    /// Binds the listening socket and the waker. The returned handle stays
    /// valid for the lifetime of the reactor.
    pub fn bind(config: ServerConfig) -> io::Result<(Self, ServerHandle)> {
        let poll = Poll::new()?;
        let mut listener =
            TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port)))?;
        let local_addr = listener.local_addr()?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;

        let waker = Waker::new(poll.registry(), WAKER)?;
        let shared = Arc::new(Shared {
            pending: Mutex::new(Vec::new()),
            time_to_broadcast: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            waker,
        });
        let handle = ServerHandle { shared: Arc::clone(&shared), local_addr };

        let server = Self {
            events: Events::with_capacity(128),
            inner: Reactor {
                poll,
                listener,
                clients: Vec::new(),
                next_token: FIRST_CLIENT_TOKEN,
                conversation: Conversation::with_capacity(config.history_capacity),
                shared,
                config,
                local_addr,
            },
        };
        Ok((server, handle))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Runs the event loop until [`ServerHandle::shutdown`].
    ///
    /// Per-connection failures are contained at that connection; only a
    /// selector-level failure propagates out.
    pub fn run(&mut self) -> io::Result<()> {
        info!(addr = ?self.inner.local_addr, "chat server listening");
        loop {
            if self.inner.shared.shutdown.load(Ordering::Acquire) {
                self.inner.close_all();
                info!("chat server stopped");
                return Ok(());
            }

            self.inner.drain_broadcasts();

            self.inner.poll.poll(&mut self.events, None)?;
            for ev in self.events.iter() {
                self.inner.handle_event(ev);
            }
        }
    }
}

impl Reactor {
    fn handle_event(&mut self, ev: &Event) {
        match ev.token() {
            // Flags are drained at the top of the loop; the event only
            // unblocks `poll`.
            WAKER => {}
            LISTENER => self.accept_new(),
            token => {
                // Every removal deregisters before the next poll, so an
                // event for a token missing from the table is a
                // bookkeeping bug, not a race.
                if self.position(token).is_none() {
                    safe_panic!("got event for unknown token {token:?}");
                    return;
                }
                if ev.is_readable() && !self.on_read(token) {
                    return;
                }
                if ev.is_writable() {
                    self.on_write(token);
                }
            }
        }
    }

    /// Accepts until the listener would block. Each new client is seeded
    /// with the conversation replay, so it starts write-armed and idles to
    /// READ interest once the replay drains.
    fn accept_new(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    info!(?addr, "client connected");
                    let token = Token(self.next_token);
                    if let Err(err) =
                        self.poll.registry().register(&mut stream, token, Interest::READABLE)
                    {
                        warn!(?err, "couldn't register client");
                        let _ = stream.shutdown(std::net::Shutdown::Both);
                        continue;
                    }
                    let Ok(stream) = FramedStream::from_stream(stream, addr, token)
                        .inspect_err(|err| warn!(?err, "couldn't set up client stream"))
                    else {
                        continue;
                    };

                    let mut client = Client {
                        stream: stream.with_watermark(self.config.outbound_watermark),
                        username: ANONYMOUS.to_owned(),
                    };
                    if self.replay_history(&mut client) == ConnState::Disconnected {
                        client.stream.close(self.poll.registry());
                        continue;
                    }

                    self.clients.push((token, client));
                    self.next_token += 1;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!(?err, "accept failed");
                    return;
                }
            }
        }
    }

    fn replay_history(&self, client: &mut Client) -> ConnState {
        for entry in self.conversation.snapshot() {
            if client.stream.enqueue(self.poll.registry(), frame_payload(entry)) ==
                ConnState::Disconnected
            {
                return ConnState::Disconnected;
            }
        }
        ConnState::Alive
    }

    /// Reads everything available, then dispatches each decoded payload in
    /// arrival order. Returns false once the client is gone.
    fn on_read(&mut self, token: Token) -> bool {
        let Some(idx) = self.position(token) else { return false };

        let read_state = match self.clients[idx].1.stream.read_ready() {
            Ok(state) => state,
            Err(err) => {
                self.drop_violator(idx, &err);
                return false;
            }
        };

        // Dispatch before acting on EOF: a DISCONNECT followed by an
        // immediate close still deserves its leave broadcast.
        loop {
            let Some(idx) = self.position(token) else { return false };
            let Some(payload) = self.clients[idx].1.stream.next_payload() else { break };
            if !self.dispatch(token, &payload) {
                return false;
            }
        }

        if read_state == ConnState::Disconnected {
            if let Some(idx) = self.position(token) {
                let client = self.remove_client(idx);
                debug!(username = %client.username, "peer closed connection");
            }
            return false;
        }
        true
    }

    /// Routes one decoded payload. Returns false once the client is gone.
    fn dispatch(&mut self, token: Token, payload: &str) -> bool {
        let msg = match Message::parse(payload) {
            Ok(msg) => msg,
            Err(err) => {
                if let Some(idx) = self.position(token) {
                    self.drop_violator(idx, &err);
                }
                return false;
            }
        };

        // Bodies are echoed back inside BROADCAST payloads, so an embedded
        // delimiter must be stopped here rather than corrupting every
        // receiver's splitter.
        if let Err(err) = validate_body(&msg.body) {
            if let Some(idx) = self.position(token) {
                self.drop_violator(idx, &err);
            }
            return false;
        }

        let Some(idx) = self.position(token) else { return false };
        match msg.kind {
            MessageKind::User => {
                self.clients[idx].1.username = msg.body;
                let username = self.clients[idx].1.username.clone();
                self.broadcast(format!("{username} joined conversation."));
                true
            }
            MessageKind::Entry => {
                let username = &self.clients[idx].1.username;
                self.broadcast(format!("{username}: {}", msg.body));
                true
            }
            MessageKind::Disconnect => {
                let client = self.remove_client(idx);
                info!(username = %client.username, "client disconnected");
                self.broadcast(format!("{} left conversation.", client.username));
                false
            }
            MessageKind::Broadcast => {
                self.drop_violator(idx, &ProtocolError::UnexpectedKind(MessageKind::Broadcast));
                false
            }
        }
    }

    fn on_write(&mut self, token: Token) {
        if let Some(idx) = self.position(token) {
            if self.clients[idx].1.stream.flush(self.poll.registry()) == ConnState::Disconnected {
                self.remove_client(idx);
            }
        }
    }

    /// Queues a broadcast exactly like an external producer would; the
    /// fan-out happens on the next loop turn.
    fn broadcast(&self, body: String) {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(body);
        self.shared.time_to_broadcast.store(true, Ordering::Release);
        if let Err(err) = self.shared.waker.wake() {
            warn!(?err, "selector wake failed");
        }
    }

    /// Applies every queued broadcast: record it, frame it once, enqueue it
    /// to every live client and arm their WRITABLE interest.
    fn drain_broadcasts(&mut self) {
        if !self.shared.time_to_broadcast.swap(false, Ordering::Acquire) {
            return;
        }
        let pending = std::mem::take(
            &mut *self.shared.pending.lock().unwrap_or_else(PoisonError::into_inner),
        );

        for body in pending {
            // Server-originated bodies were validated at dispatch; this
            // guards external `ServerHandle::broadcast` callers.
            if let Err(err) = validate_body(&body) {
                warn!(%err, "dropping broadcast with embedded delimiter");
                continue;
            }
            let payload = Message::new(MessageKind::Broadcast, body).to_payload();
            let frame = frame_payload(&payload);
            self.conversation.append(payload);

            let mut i = self.clients.len();
            while i != 0 {
                i -= 1;
                if self.clients[i].1.stream.enqueue(self.poll.registry(), frame.clone()) ==
                    ConnState::Disconnected
                {
                    self.remove_client(i);
                }
            }
        }
    }

    fn position(&self, token: Token) -> Option<usize> {
        self.clients.iter().position(|(t, _)| *t == token)
    }

    fn remove_client(&mut self, idx: usize) -> Client {
        let (_, mut client) = self.clients.swap_remove(idx);
        client.stream.close(self.poll.registry());
        client
    }

    fn drop_violator(&mut self, idx: usize, err: &ProtocolError) {
        let client = self.remove_client(idx);
        warn!(
            peer = ?client.stream.peer_addr(),
            username = %client.username,
            %err,
            "protocol violation, client dropped"
        );
    }

    fn close_all(&mut self) {
        for (_, client) in &mut self.clients {
            client.stream.close(self.poll.registry());
        }
        self.clients.clear();
        let _ = self.poll.registry().deregister(&mut self.listener);
    }
}
