mod error;
mod frame;
mod message;
mod splitter;

pub use error::ProtocolError;
pub use frame::{
    LENGTH_DELIMITER, MAX_FRAME_LEN, TYPE_DELIMITER, encode_message, frame_payload, validate_body,
};
pub use message::{Message, MessageKind};
pub use splitter::Splitter;
