use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use futures::future::BoxFuture;
use relaybot_agents::AgentRuntime;
use relaybot_channels::{Command, OnMessageFn, parse_command, resolve_content, should_respond};
use relaybot_common::{ConversationId, Error, IncomingEnvelope};
use relaybot_security::Allowlist;
use tracing::{error, info, warn};

pub const WELCOME_TEXT: &str = "Hello! I'm an AI assistant powered by LLMs.\n\n\
I can:\n\
- Answer questions and have conversations\n\
- Search the web for information\n\
- Fetch and analyze web pages\n\
- Extract information from YouTube videos\n\
- Verify claims and provide context\n\n\
In direct messages, just send me a message.\n\
In groups, mention me with @botname to get my attention.\n\n\
Try commands like:\n\
• 'verify claims' - fact-check statements\n\
• 'provide context' - get background info\n\
• 'suggest alternatives' - explore different explanations\n\
• 'explain simply' or 'eli5' - simplify complex topics";
pub const CLEARED_TEXT: &str = "Conversation history cleared!";
pub const EMPTY_REPLY_TEXT: &str = "I'm not sure how to respond. Could you rephrase your question?";
pub const ERROR_TEXT: &str = "Sorry, I encountered an error processing your message.";
pub const AUTH_ERROR_TEXT: &str = "Sorry, I can't reach the language model right now: \
the bot's API credentials were rejected. Please ask the operator to check them.";

/// Applies access control, commands and intake rules to inbound messages and
/// hands the rest to the agent runtime.
pub struct Relay {
    runtime: Arc<AgentRuntime>,
    allowlist: Allowlist,
    bot_username: OnceLock<String>,
}

impl Relay {
    pub fn new(runtime: Arc<AgentRuntime>, allowlist: Allowlist) -> Self {
        Self {
            runtime,
            allowlist,
            bot_username: OnceLock::new(),
        }
    }

    pub fn runtime(&self) -> &Arc<AgentRuntime> {
        &self.runtime
    }

    /// Record the bot's username once the channel has learned it, so that
    /// `/cmd@otherbot` is ignored.
    pub fn set_bot_username(&self, username: impl Into<String>) {
        if self.bot_username.set(username.into()).is_err() {
            warn!("bot username already set; keeping the first value");
        }
    }

    /// Decide what to do with `envelope`. `None` drops it silently; `Some`
    /// is the work producing the reply text.
    pub fn dispatch(self: &Arc<Self>, envelope: IncomingEnvelope) -> Option<BoxFuture<'static, String>> {
        if !self
            .allowlist
            .is_allowed(envelope.conversation_id, envelope.sender_id)
        {
            return None;
        }

        let conversation_id = ConversationId::from(envelope.conversation_id);
        let bot_username = self.bot_username.get().map(String::as_str);

        if let Some(command) = parse_command(&envelope.text, bot_username) {
            let relay = Arc::clone(self);
            return Some(async move { relay.run_command(command, &conversation_id).await }.boxed());
        }

        if !should_respond(&envelope) {
            return None;
        }
        let content = resolve_content(&envelope)?;

        let relay = Arc::clone(self);
        Some(async move { relay.answer(&conversation_id, &content).await }.boxed())
    }

    /// Run `envelope` to completion, for callers that do not need the split
    /// between accepting a message and producing its reply.
    pub async fn handle(self: &Arc<Self>, envelope: IncomingEnvelope) -> Option<String> {
        match self.dispatch(envelope) {
            Some(work) => Some(work.await),
            None => None,
        }
    }

    /// Adapt this relay to the channel callback signature.
    pub fn on_message_fn(self: &Arc<Self>) -> OnMessageFn {
        let relay = Arc::clone(self);
        Arc::new(move |envelope| relay.dispatch(envelope))
    }

    async fn run_command(&self, command: Command, conversation_id: &ConversationId) -> String {
        info!(conversation = %conversation_id, ?command, "command received");
        match command {
            Command::Start | Command::Help => WELCOME_TEXT.to_string(),
            Command::Clear | Command::Reset => {
                self.runtime.reset(conversation_id).await;
                CLEARED_TEXT.to_string()
            }
        }
    }

    async fn answer(&self, conversation_id: &ConversationId, content: &str) -> String {
        match self.runtime.process_message(conversation_id, content).await {
            Ok(reply) if reply.text.trim().is_empty() => EMPTY_REPLY_TEXT.to_string(),
            Ok(reply) => reply.text,
            Err(Error::ProviderAuth(e)) => {
                error!(conversation = %conversation_id, "provider rejected credentials: {e}");
                AUTH_ERROR_TEXT.to_string()
            }
            Err(e) => {
                error!(conversation = %conversation_id, "error handling message: {e}");
                ERROR_TEXT.to_string()
            }
        }
    }
}
