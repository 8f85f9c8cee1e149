use std::{
    collections::VecDeque,
    net::ToSocketAddrs,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use crossbeam_channel::Sender;
use mio::{Events, Interest, Poll, Token, Waker};
use parley_net::{ConnState, FramedStream};
use parley_protocol::{Message, MessageKind, encode_message, frame_payload};
use tracing::{debug, warn};

use crate::{
    error::ClientError,
    listener::CommunicationListener,
    notify::{Listeners, Notification, spawn_notifier},
};

const STREAM: Token = Token(0);
const WAKER: Token = Token(1);

/// Lifecycle of the client connection, owned by the I/O thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Connecting,
    Connected,
    Disconnecting,
    Closed,
}

/// State shared between the embedding threads and the I/O thread.
struct ClientShared {
    outbound: Mutex<VecDeque<Vec<u8>>>,
    time_to_send: AtomicBool,
    /// Cleared by `disconnect` (or a fatal error); the I/O loop drains the
    /// outbound queue and then closes.
    connected: AtomicBool,
    /// Guards the one-shot disconnect handshake.
    disconnect_requested: AtomicBool,
    waker: Waker,
}

impl ClientShared {
    fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            warn!(?err, "selector wake failed");
        }
    }

    fn submit(&self, frame: Vec<u8>) {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner).push_back(frame);
        self.time_to_send.store(true, Ordering::Release);
        self.wake();
    }
}

/// A live connection: the shared flags plus the two worker threads.
struct ActiveConnection {
    shared: Arc<ClientShared>,
    io_thread: thread::JoinHandle<()>,
    notify_thread: thread::JoinHandle<()>,
}

/// Non-blocking chat client: one I/O thread owning the selector and the
/// connection record, one notifier thread for listener callbacks.
///
/// Listeners are registered up front, then `connect` starts the
/// non-blocking connect and spawns the threads. `send_username`,
/// `send_chat_entry` and `disconnect` are thread-safe: they push framed
/// bytes onto a mutex-guarded queue and wake the selector, which moves
/// them onto the wire on its next turn. Frames submitted while the connect
/// is still in flight are flushed once it completes.
#[derive(Default)]
pub struct ChatClient {
    listeners: Listeners,
    active: Mutex<Option<ActiveConnection>>,
}

impl ChatClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer. Listeners added before `connect` observe the
    /// full callback sequence; one added later misses the earlier
    /// callbacks.
    pub fn add_communication_listener(&self, listener: Arc<dyn CommunicationListener>) {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).push(listener);
    }

    /// Starts a non-blocking connect and spawns the I/O thread. The
    /// connection completes on the loop; `connected` fires on the
    /// listeners once it does.
    pub fn connect(&self, host: &str, port: u16) -> Result<(), ClientError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.is_some() {
            return Err(ClientError::AlreadyConnected);
        }

        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or(ClientError::AddressResolution)?;

        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let mut stream = mio::net::TcpStream::connect(addr)?;
        poll.registry()
            .register(&mut stream, STREAM, Interest::READABLE | Interest::WRITABLE)?;

        let shared = Arc::new(ClientShared {
            outbound: Mutex::new(VecDeque::new()),
            time_to_send: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            disconnect_requested: AtomicBool::new(false),
            waker,
        });

        let (notify_tx, notify_rx) = crossbeam_channel::unbounded();
        let notify_thread = spawn_notifier(Arc::clone(&self.listeners), notify_rx);

        let mut io = IoLoop {
            events: Events::with_capacity(32),
            inner: IoInner {
                poll,
                state: ClientState::Connecting,
                pending_connect: Some(stream),
                stream: None,
                shared: Arc::clone(&shared),
                notify: notify_tx,
            },
        };
        let io_thread = thread::Builder::new()
            .name("parley-client-io".to_owned())
            .spawn(move || io.run())
            .expect("failed to spawn client io thread");

        *active = Some(ActiveConnection { shared, io_thread, notify_thread });
        Ok(())
    }

    pub fn send_username(&self, name: &str) -> Result<(), ClientError> {
        self.send(MessageKind::User, name)
    }

    pub fn send_chat_entry(&self, text: &str) -> Result<(), ClientError> {
        self.send(MessageKind::Entry, text)
    }

    /// Informs the server, then lets the loop drain the outbound queue
    /// before closing. Safe to call more than once; does not block.
    pub fn disconnect(&self) {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(conn) = active.as_ref() else { return };
        if conn.shared.disconnect_requested.swap(true, Ordering::AcqRel) {
            return;
        }

        // The frame goes in before the flag flips, so the loop turn that
        // observes the shutdown still finds the DISCONNECT to deliver.
        let payload = Message::new(MessageKind::Disconnect, "").to_payload();
        conn.shared.submit(frame_payload(&payload));
        conn.shared.connected.store(false, Ordering::Release);
        conn.shared.wake();
    }

    fn send(&self, kind: MessageKind, body: &str) -> Result<(), ClientError> {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = active.as_ref().ok_or(ClientError::NotConnected)?;
        if !conn.shared.connected.load(Ordering::Acquire) {
            return Err(ClientError::NotConnected);
        }
        let frame = encode_message(kind, body)?;
        conn.shared.submit(frame);
        Ok(())
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.disconnect();
        let conn = self.active.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(conn) = conn {
            let _ = conn.io_thread.join();
            let _ = conn.notify_thread.join();
        }
    }
}

struct IoLoop {
    events: Events,
    inner: IoInner,
}

struct IoInner {
    poll: Poll,
    state: ClientState,
    pending_connect: Option<mio::net::TcpStream>,
    stream: Option<FramedStream>,
    shared: Arc<ClientShared>,
    notify: Sender<Notification>,
}

impl IoLoop {
    fn run(&mut self) {
        loop {
            if !self.inner.shared.connected.load(Ordering::Acquire) &&
                matches!(self.inner.state, ClientState::Connecting | ClientState::Connected)
            {
                self.inner.state = ClientState::Disconnecting;
            }

            self.inner.drain_submissions();

            if self.inner.state == ClientState::Disconnecting &&
                self.inner.stream.as_ref().is_none_or(FramedStream::is_drained)
            {
                self.inner.close();
            }
            if self.inner.state == ClientState::Closed {
                return;
            }

            if let Err(err) = self.inner.poll.poll(&mut self.events, None) {
                warn!(?err, "client selector failed");
                self.inner.close();
                return;
            }

            for ev in self.events.iter() {
                if ev.token() == STREAM {
                    self.inner.on_stream_ready(ev.is_readable(), ev.is_writable());
                }
                if self.inner.state == ClientState::Closed {
                    return;
                }
            }
        }
    }
}

impl IoInner {
    fn on_stream_ready(&mut self, readable: bool, writable: bool) {
        if self.state == ClientState::Connecting {
            if writable {
                self.finish_connect();
            }
            return;
        }

        if readable && !self.on_read() {
            return;
        }
        if writable {
            self.on_write();
        }
    }

    /// A writable event on a connecting socket resolves the connect; the
    /// error, if any, surfaces through `take_error` or `peer_addr`.
    fn finish_connect(&mut self) {
        let Some(mut raw) = self.pending_connect.take() else { return };

        let checked = match raw.take_error() {
            Ok(None) => raw.peer_addr(),
            Ok(Some(err)) | Err(err) => Err(err),
        };
        let peer_addr = match checked {
            Ok(addr) => addr,
            Err(err) => {
                warn!(?err, "connect failed");
                let _ = self.poll.registry().deregister(&mut raw);
                self.close();
                return;
            }
        };

        if let Err(err) = self.poll.registry().reregister(&mut raw, STREAM, Interest::READABLE) {
            warn!(?err, "couldn't reregister connected stream");
            let _ = self.poll.registry().deregister(&mut raw);
            self.close();
            return;
        }

        match FramedStream::from_stream(raw, peer_addr, STREAM) {
            Ok(stream) => {
                debug!(?peer_addr, "connected");
                self.stream = Some(stream);
                self.state = ClientState::Connected;
                let _ = self.notify.send(Notification::Connected(peer_addr));
            }
            Err(err) => {
                warn!(?err, "couldn't set up connected stream");
                self.close();
            }
        }
    }

    /// Moves externally submitted frames onto the connection's outbound
    /// queue. Left queued while the connect is still in flight.
    fn drain_submissions(&mut self) {
        let Some(stream) = self.stream.as_mut() else { return };
        if !self.shared.time_to_send.swap(false, Ordering::Acquire) {
            return;
        }
        let frames = std::mem::take(
            &mut *self.shared.outbound.lock().unwrap_or_else(PoisonError::into_inner),
        );

        let mut dead = false;
        for frame in frames {
            if stream.enqueue(self.poll.registry(), frame) == ConnState::Disconnected {
                dead = true;
                break;
            }
        }
        if dead {
            self.close();
        }
    }

    /// Returns false once the connection is gone.
    fn on_read(&mut self) -> bool {
        let Some(stream) = self.stream.as_mut() else { return false };

        let state = match stream.read_ready() {
            Ok(state) => state,
            Err(err) => {
                warn!(%err, "protocol violation from server");
                self.close();
                return false;
            }
        };

        while let Some(payload) = self.stream.as_mut().and_then(FramedStream::next_payload) {
            match Message::parse(&payload) {
                // Only broadcasts travel server to client.
                Ok(msg) if msg.kind == MessageKind::Broadcast => {
                    let _ = self.notify.send(Notification::Received(msg.body));
                }
                Ok(msg) => {
                    warn!(kind = %msg.kind, "unexpected kind from server");
                    self.close();
                    return false;
                }
                Err(err) => {
                    warn!(%err, "unparsable payload from server");
                    self.close();
                    return false;
                }
            }
        }

        if state == ConnState::Disconnected {
            debug!("server closed connection");
            self.close();
            return false;
        }
        true
    }

    fn on_write(&mut self) {
        let Some(stream) = self.stream.as_mut() else { return };
        if stream.flush(self.poll.registry()) == ConnState::Disconnected {
            self.close();
        }
    }

    /// Tears the connection down exactly once; `disconnected` is the last
    /// callback the listeners observe.
    fn close(&mut self) {
        if self.state == ClientState::Closed {
            return;
        }
        if let Some(mut stream) = self.stream.take() {
            stream.close(self.poll.registry());
        }
        self.pending_connect = None;
        self.shared.connected.store(false, Ordering::Release);
        self.state = ClientState::Closed;
        let _ = self.notify.send(Notification::Disconnected);
    }
}
