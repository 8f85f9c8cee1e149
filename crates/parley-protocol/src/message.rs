use std::fmt;

use crate::{ProtocolError, frame::TYPE_DELIMITER};

/// Closed set of message kinds. `User`, `Entry` and `Disconnect` travel
/// client to server only, `Broadcast` server to client only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    User,
    Entry,
    Disconnect,
    Broadcast,
}

impl MessageKind {
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Entry => "ENTRY",
            Self::Disconnect => "DISCONNECT",
            Self::Broadcast => "BROADCAST",
        }
    }

    /// Maps a wire token to a kind. Matching is case-insensitive, the wire
    /// identifiers themselves are always emitted uppercase.
    pub fn from_wire(token: &str) -> Result<Self, ProtocolError> {
        match token.to_ascii_uppercase().as_str() {
            "USER" => Ok(Self::User),
            "ENTRY" => Ok(Self::Entry),
            "DISCONNECT" => Ok(Self::Disconnect),
            "BROADCAST" => Ok(Self::Broadcast),
            other => Err(ProtocolError::UnknownKind(other.to_owned())),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// A decoded payload: kind plus optional UTF-8 body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub body: String,
}

impl Message {
    pub fn new(kind: MessageKind, body: impl Into<String>) -> Self {
        Self { kind, body: body.into() }
    }

    /// Splits a payload at the first `$$` into kind token and body. A
    /// payload without `$$` is a bare kind with an empty body. The body is
    /// trimmed of surrounding whitespace.
    pub fn parse(payload: &str) -> Result<Self, ProtocolError> {
        let (token, body) = match payload.split_once(TYPE_DELIMITER) {
            Some((token, body)) => (token, body.trim()),
            None => (payload, ""),
        };
        Ok(Self { kind: MessageKind::from_wire(token)?, body: body.to_owned() })
    }

    /// Renders `<KIND>$$<body>`, or just `<KIND>` when the body is empty.
    pub fn to_payload(&self) -> String {
        if self.body.is_empty() {
            self.kind.as_wire().to_owned()
        } else {
            format!("{}{}{}", self.kind, TYPE_DELIMITER, self.body)
        }
    }
}
