//! Publish/subscribe message bus for inter-agent signaling.

mod hub;
mod message;

pub use hub::{BusStats, HandlerFuture, MessageBus, MessageFilter, Subscription};
pub use message::{Message, MessageDraft, MessagePayload, MessageType};
