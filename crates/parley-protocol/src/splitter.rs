use std::collections::VecDeque;

use crate::{
    ProtocolError,
    frame::{LENGTH_DELIMITER, MAX_FRAME_LEN},
};

// Longest header a frame under MAX_FRAME_LEN can carry, plus one byte for a
// dangling half of the delimiter.
const MAX_HEADER_LEN: usize = 8;

/// Reassembles a byte stream into complete payloads.
///
/// Bytes arrive in arbitrary TCP segmentation; `append` accumulates them and
/// extracts every frame that has fully arrived into a FIFO of payloads.
/// After every append the accumulator holds at most one incomplete frame,
/// either an unfinished length header or a length-known but under-filled
/// payload.
///
/// The splitter works on bytes, so a chunk boundary inside a multi-byte
/// character cannot desynchronize it; payloads are UTF-8 validated once
/// their final byte arrives.
#[derive(Debug, Default)]
pub struct Splitter {
    acc: Vec<u8>,
    ready: VecDeque<String>,
}

impl Splitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds received bytes in, then extracts every completed frame.
    ///
    /// An error means the stream is unrecoverably out of sync and the
    /// connection must be closed.
    pub fn append(&mut self, chunk: &[u8]) -> Result<(), ProtocolError> {
        self.acc.extend_from_slice(chunk);
        self.extract()
    }

    pub fn has_next(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Pops the oldest completed payload.
    pub fn next_payload(&mut self) -> Option<String> {
        self.ready.pop_front()
    }

    /// Number of bytes buffered for the (at most one) incomplete frame.
    pub fn pending_len(&self) -> usize {
        self.acc.len()
    }

    fn extract(&mut self) -> Result<(), ProtocolError> {
        loop {
            let Some(delim) = find_delimiter(&self.acc) else {
                // No complete header. Valid headers are short, so a long
                // delimiter-less run can never become a frame.
                if self.acc.len() > MAX_HEADER_LEN {
                    return Err(ProtocolError::BadLength(header_text(&self.acc)));
                }
                return Ok(());
            };

            let len = parse_len(&self.acc[..delim])?;
            let payload_start = delim + LENGTH_DELIMITER.len();
            if self.acc.len() - payload_start < len {
                return Ok(());
            }

            let payload = std::str::from_utf8(&self.acc[payload_start..payload_start + len])
                .map_err(|_| ProtocolError::InvalidUtf8)?
                .to_owned();
            self.ready.push_back(payload);
            self.acc.drain(..payload_start + len);
        }
    }
}

fn find_delimiter(acc: &[u8]) -> Option<usize> {
    let delim = LENGTH_DELIMITER.as_bytes();
    acc.windows(delim.len()).position(|w| w == delim)
}

fn parse_len(header: &[u8]) -> Result<usize, ProtocolError> {
    let text = std::str::from_utf8(header).map_err(|_| ProtocolError::InvalidUtf8)?;
    let len = text
        .parse::<usize>()
        .map_err(|_| ProtocolError::BadLength(text.to_owned()))?;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::LengthOverflow(len));
    }
    Ok(len)
}

fn header_text(acc: &[u8]) -> String {
    String::from_utf8_lossy(&acc[..acc.len().min(MAX_HEADER_LEN)]).into_owned()
}
