use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::SocketAddr,
};

use mio::{Interest, Registry, Token};
use parley_protocol::{ProtocolError, Splitter};
use tracing::{debug, warn};

/// Scratch buffer for a single non-blocking read. Frames longer than this
/// assemble across multiple read events.
const MAX_MSG_LENGTH: usize = 8192;

/// Ceiling on bytes queued for one connection before it is considered a
/// lost cause. A peer that never reads would otherwise grow the queue
/// without bound.
pub const DEFAULT_OUTBOUND_WATERMARK: usize = 4 * 1024 * 1024;

/// Response type for all socket-facing calls.
///
/// `Alive` means the connection is still usable.
/// `Disconnected` means the peer is gone and the connection must be removed.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnState {
    Alive,
    Disconnected,
}

/// Single mio-backed chat connection, shared by both endpoints.
///
/// Inbound:
///   - `read_ready` drains the socket until `WouldBlock`, feeding bytes to
///     the frame splitter.
///   - `next_payload` then yields each fully reassembled payload in arrival
///     order.
///
/// Outbound:
///   - `enqueue` pushes one fully framed message onto the send queue and
///     arms WRITABLE interest.
///   - `flush` writes the head of the queue as far as the socket accepts.
///     The head may be left partially written; everything behind it is
///     untouched.
///   - WRITABLE interest is dropped only once the queue is fully drained.
///     Invariant: `writable_armed == !send_q.is_empty()`
pub struct FramedStream {
    stream: mio::net::TcpStream,
    peer_addr: SocketAddr,
    token: Token,

    splitter: Splitter,

    send_q: VecDeque<Vec<u8>>,
    queued_bytes: usize,
    watermark: usize,
    writable_armed: bool,
}

impl FramedStream {
    /// Wraps an already registered mio stream. Registration stays READABLE
    /// until the first `enqueue` arms WRITABLE.
    pub fn from_stream(
        stream: mio::net::TcpStream,
        peer_addr: SocketAddr,
        token: Token,
    ) -> io::Result<Self> {
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            peer_addr,
            token,
            splitter: Splitter::new(),
            send_q: VecDeque::with_capacity(16),
            queued_bytes: 0,
            watermark: DEFAULT_OUTBOUND_WATERMARK,
            writable_armed: false,
        })
    }

    pub fn with_watermark(mut self, watermark: usize) -> Self {
        self.watermark = watermark;
        self
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// True once every queued byte has reached the kernel.
    pub fn is_drained(&self) -> bool {
        self.send_q.is_empty()
    }

    /// Queues one framed message and arms WRITABLE interest.
    ///
    /// Exceeding the outbound watermark disconnects: the peer is either not
    /// reading or not keeping up, and the queue must not grow without bound.
    pub fn enqueue(&mut self, registry: &Registry, frame: Vec<u8>) -> ConnState {
        if self.queued_bytes + frame.len() > self.watermark {
            warn!(
                peer = ?self.peer_addr,
                queued = self.queued_bytes,
                watermark = self.watermark,
                "outbound queue over watermark, disconnecting slow peer"
            );
            return ConnState::Disconnected;
        }

        self.queued_bytes += frame.len();
        self.send_q.push_back(frame);
        self.arm_writable(registry)
    }

    /// Drains the socket until it would block, feeding the splitter.
    ///
    /// `Ok(Disconnected)` is an orderly or errored transport end; a
    /// `ProtocolError` means the peer sent garbage and must be dropped.
    pub fn read_ready(&mut self) -> Result<ConnState, ProtocolError> {
        let mut scratch = [0_u8; MAX_MSG_LENGTH];
        loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => return Ok(ConnState::Disconnected),

                Ok(n) => self.splitter.append(&scratch[..n])?,

                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ConnState::Alive);
                }

                Err(err) => {
                    debug!(?err, peer = ?self.peer_addr, "tcp: read");
                    return Ok(ConnState::Disconnected);
                }
            }
        }
    }

    /// Next fully reassembled payload, in arrival order.
    pub fn next_payload(&mut self) -> Option<String> {
        self.splitter.next_payload()
    }

    /// Writes queued frames until the kernel blocks or the queue empties.
    /// Drops WRITABLE interest only when fully drained.
    pub fn flush(&mut self, registry: &Registry) -> ConnState {
        while let Some(front) = self.send_q.front_mut() {
            match self.stream.write(front) {
                Ok(0) => return ConnState::Disconnected,

                Ok(n) => {
                    self.queued_bytes -= n;
                    if n == front.len() {
                        self.send_q.pop_front();
                    } else {
                        front.drain(..n);
                    }
                }

                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,

                Err(err) => {
                    debug!(?err, peer = ?self.peer_addr, "tcp: write");
                    return ConnState::Disconnected;
                }
            }
        }

        if self.send_q.is_empty() && self.writable_armed {
            if let Err(err) = registry.reregister(&mut self.stream, self.token, Interest::READABLE)
            {
                debug!(?err, "tcp: reregister drop writable");
                return ConnState::Disconnected;
            }
            self.writable_armed = false;
        }

        ConnState::Alive
    }

    /// Arms WRITABLE notifications on the empty -> non-empty transition.
    fn arm_writable(&mut self, registry: &Registry) -> ConnState {
        if !self.writable_armed {
            if let Err(err) = registry.reregister(
                &mut self.stream,
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                debug!(?err, "tcp: reregister arm writable");
                return ConnState::Disconnected;
            }
            self.writable_armed = true;
        }
        ConnState::Alive
    }

    pub fn close(&mut self, registry: &Registry) -> SocketAddr {
        debug!(peer = ?self.peer_addr, "terminating connection");
        if let Err(err) = registry.deregister(&mut self.stream) {
            warn!(?err, peer = ?self.peer_addr, "deregister failed during close");
        }
        if let Err(err) = self.stream.shutdown(std::net::Shutdown::Both) {
            // NotConnected is routine when the peer vanished first.
            if err.kind() != io::ErrorKind::NotConnected {
                warn!(?err, peer = ?self.peer_addr, "socket shutdown failed");
            }
        }
        self.peer_addr
    }
}

/// Set kernel SO_SNDBUF and SO_RCVBUF on a mio TcpStream. Tests use this to
/// constrain the pipe and force the partial-write path.
pub fn set_socket_buf_size(stream: &mio::net::TcpStream, size: usize) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
