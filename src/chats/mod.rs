//! Chats — model and the chat queue processor.

pub mod model;
pub mod processor;

pub use model::{Chat, ChatMessage, ChatRole};
pub use processor::ChatProcessor;
