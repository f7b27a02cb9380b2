//! Marketplace API surface: typed endpoints, the conversation message
//! source, and the unread counter.

mod client;
mod notifications;
mod types;

pub use client::{ConversationMessages, MarketClient};
pub use notifications::UnreadCounter;
pub use types::{Conversation, Message, UserSummary};
