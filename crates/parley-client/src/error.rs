use std::io;

use parley_protocol::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("could not resolve server address")]
    AddressResolution,
    #[error("already connected")]
    AlreadyConnected,
    #[error("connection is closed")]
    NotConnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] io::Error),
}
