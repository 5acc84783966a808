pub mod envelope;
pub mod error;
pub mod message;
pub mod types;

pub use envelope::IncomingEnvelope;
pub use error::{Error, Result};
pub use message::{ChatMessage, ChatRole, ToolCall};
pub use types::ConversationId;
