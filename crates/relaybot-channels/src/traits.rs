use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use relaybot_common::{IncomingEnvelope, Result};
use serde::{Deserialize, Serialize};

/// Callback invoked for every inbound message a channel receives.
///
/// Returning `None` drops the message without any visible reaction. `Some`
/// carries the work that produces the reply; the channel shows a typing
/// indicator while it runs and sends the resulting text back to the chat.
pub type OnMessageFn =
    Arc<dyn Fn(IncomingEnvelope) -> Option<BoxFuture<'static, String>> + Send + Sync>;

/// Lifecycle management for a messaging channel (connect, disconnect, status).
#[async_trait]
pub trait Channel: Send {
    /// Unique identifier for this channel type.
    fn channel_type(&self) -> &str;

    /// Human-readable display name.
    fn display_name(&self) -> &str;

    /// Start the channel, connecting to the external service.
    async fn connect(&mut self) -> Result<()>;

    /// Stop receiving messages and wait for in-progress replies to finish.
    async fn disconnect(&mut self) -> Result<()>;

    fn status(&self) -> ChannelStatus;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelStatus {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}
