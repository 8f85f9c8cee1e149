use crate::{ProtocolError, message::Message, message::MessageKind};

/// Separates the decimal length header from the payload.
pub const LENGTH_DELIMITER: &str = "##";
/// Separates the kind token from the body inside a payload.
pub const TYPE_DELIMITER: &str = "$$";
/// Upper bound on a declared payload length. Anything above this is a
/// protocol violation rather than a buffer to allocate.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Prepends the length header to a payload.
///
/// The length is the UTF-8 byte count of the payload. The source protocol
/// counted UTF-16 code units, which agrees for ASCII traffic only; this
/// implementation commits to byte counts.
pub fn frame_payload(payload: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 10);
    frame.extend_from_slice(payload.len().to_string().as_bytes());
    frame.extend_from_slice(LENGTH_DELIMITER.as_bytes());
    frame.extend_from_slice(payload.as_bytes());
    frame
}

/// Rejects bodies that embed a protocol delimiter. Nothing escapes `##` or
/// `$$` on the wire, so such a body would shift the kind/body split on the
/// receiving side.
pub fn validate_body(body: &str) -> Result<(), ProtocolError> {
    if body.contains(LENGTH_DELIMITER) || body.contains(TYPE_DELIMITER) {
        return Err(ProtocolError::DelimiterInBody);
    }
    Ok(())
}

/// Composes and frames a message in one step, rejecting bodies that would
/// confuse the receiving side.
pub fn encode_message(kind: MessageKind, body: &str) -> Result<Vec<u8>, ProtocolError> {
    validate_body(body)?;
    Ok(frame_payload(&Message::new(kind, body).to_payload()))
}
