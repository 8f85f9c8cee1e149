use std::env;

use parley_server::{ChatServer, DEFAULT_PORT, ServerConfig};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    low_level,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Port is the single positional argument; anything unparsable falls back
/// to the default with a warning.
fn port_from_args() -> u16 {
    match env::args().nth(1) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(%raw, fallback = DEFAULT_PORT, "invalid port argument, using default");
            DEFAULT_PORT
        }),
        None => DEFAULT_PORT,
    }
}

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = ServerConfig { port: port_from_args(), ..ServerConfig::default() };
    let (mut server, handle) = ChatServer::bind(config)?;

    for sig in [SIGINT, SIGTERM] {
        let handle = handle.clone();
        unsafe {
            low_level::register(sig, move || handle.shutdown())
                .expect("failed to register signal handler");
        }
    }

    server.run()
}
