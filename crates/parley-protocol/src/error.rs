use thiserror::Error;

use crate::message::MessageKind;

/// Raised for anything malformed on the wire. The transport layer closes
/// the offending connection; other connections are unaffected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unparsable length header `{0}`")]
    BadLength(String),
    #[error("declared frame length {0} exceeds the frame cap")]
    LengthOverflow(usize),
    #[error("unknown message kind `{0}`")]
    UnknownKind(String),
    #[error("payload is not valid utf-8")]
    InvalidUtf8,
    #[error("message body contains a protocol delimiter")]
    DelimiterInBody,
    #[error("kind {0} not allowed in this direction")]
    UnexpectedKind(MessageKind),
}
