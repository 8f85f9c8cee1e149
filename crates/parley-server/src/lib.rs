mod conversation;
mod reactor;

pub use conversation::Conversation;
pub use reactor::{
    ChatServer, DEFAULT_HISTORY_CAPACITY, DEFAULT_PORT, ServerConfig, ServerHandle,
};
