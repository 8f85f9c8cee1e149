use std::net::SocketAddr;

/// Observer surface for a chat connection.
///
/// Callbacks run on a dedicated notifier thread, never the I/O thread, so a
/// slow listener cannot stall the socket. They are serialized per
/// connection in payload arrival order: `connected` precedes the first
/// `recvd_msg`, and `disconnected` is the final callback.
pub trait CommunicationListener: Send + Sync {
    fn connected(&self, addr: SocketAddr);
    fn disconnected(&self);
    fn recvd_msg(&self, body: String);
}
