mod assert;
mod stream;

pub use stream::{ConnState, DEFAULT_OUTBOUND_WATERMARK, FramedStream, set_socket_buf_size};
