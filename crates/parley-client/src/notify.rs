use std::{
    net::SocketAddr,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, PoisonError},
    thread,
};

use crossbeam_channel::Receiver;
use tracing::error;

use crate::listener::CommunicationListener;

pub(crate) type Listeners = Arc<Mutex<Vec<Arc<dyn CommunicationListener>>>>;

pub(crate) enum Notification {
    Connected(SocketAddr),
    Disconnected,
    Received(String),
}

/// Drains notifications in order on a dedicated thread. A single consumer
/// serializes callbacks per connection; a panicking listener is logged and
/// must not take the connection down with it.
pub(crate) fn spawn_notifier(
    listeners: Listeners,
    notifications: Receiver<Notification>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("parley-client-notify".to_owned())
        .spawn(move || {
            for note in notifications {
                let snapshot: Vec<Arc<dyn CommunicationListener>> =
                    listeners.lock().unwrap_or_else(PoisonError::into_inner).clone();
                for listener in snapshot {
                    let outcome = catch_unwind(AssertUnwindSafe(|| match &note {
                        Notification::Connected(addr) => listener.connected(*addr),
                        Notification::Disconnected => listener.disconnected(),
                        Notification::Received(body) => listener.recvd_msg(body.clone()),
                    }));
                    if outcome.is_err() {
                        error!("communication listener panicked");
                    }
                }
            }
        })
        .expect("failed to spawn notifier thread")
}
