use serde::{Deserialize, Serialize};

/// An inbound chat message as delivered by a messaging platform, before any
/// intake rule has been applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncomingEnvelope {
    /// Platform chat id. Negative ids are groups/channels on Telegram.
    pub conversation_id: i64,
    pub sender_id: i64,
    /// Message text (or caption) with any `@botname` mention already removed.
    pub text: String,
    pub is_direct: bool,
    pub mentions_bot: bool,
    pub replies_to_bot: bool,
    /// Text of the message being replied to, if this is a reply.
    pub reply_to_text: Option<String>,
    /// Display name of the original author when the message was forwarded.
    /// `Some("")` marks a forward whose origin is hidden.
    pub forwarded_from: Option<String>,
}

impl IncomingEnvelope {
    pub fn direct(conversation_id: i64, sender_id: i64, text: impl Into<String>) -> Self {
        Self {
            conversation_id,
            sender_id,
            text: text.into(),
            is_direct: true,
            ..Self::default()
        }
    }

    pub fn group(conversation_id: i64, sender_id: i64, text: impl Into<String>) -> Self {
        Self {
            conversation_id,
            sender_id,
            text: text.into(),
            is_direct: false,
            ..Self::default()
        }
    }

    pub fn is_forwarded(&self) -> bool {
        self.forwarded_from.is_some()
    }
}
