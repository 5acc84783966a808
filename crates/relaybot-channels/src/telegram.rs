use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use teloxide::dispatching::{ShutdownToken, UpdateFilterExt};
use teloxide::prelude::*;
use teloxide::types::{ChatAction, MessageOrigin};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::telegram_fmt::{TELEGRAM_MAX_MESSAGE_CHARS, split_message};
use crate::traits::{Channel, ChannelStatus, OnMessageFn};
use relaybot_common::{Error, IncomingEnvelope, Result};

/// Telegram "Group Anonymous Bot" id used for anonymous admins.
const ANONYMOUS_ADMIN_BOT_ID: u64 = 1087968824;

/// How often the typing indicator is refreshed while a reply is produced.
const TYPING_REFRESH: Duration = Duration::from_secs(4);

/// The bot's own account, learned from `getMe` at connect time.
#[derive(Debug, Clone)]
pub struct BotIdentity {
    pub id: u64,
    pub username: String,
}

impl BotIdentity {
    fn mention(&self) -> String {
        format!("@{}", self.username)
    }
}

pub struct TelegramChannel {
    bot_token: String,
    display: String,
    status: ChannelStatus,
    on_message: OnMessageFn,
    identity: Option<BotIdentity>,
    shutdown: Option<ShutdownToken>,
    task: Option<JoinHandle<()>>,
}

impl TelegramChannel {
    pub fn new(bot_token: impl Into<String>, on_message: OnMessageFn) -> Self {
        Self {
            bot_token: bot_token.into(),
            display: "Telegram".to_string(),
            status: ChannelStatus::Disconnected,
            on_message,
            identity: None,
            shutdown: None,
            task: None,
        }
    }

    /// The connected bot account, once `connect` has succeeded.
    pub fn identity(&self) -> Option<&BotIdentity> {
        self.identity.as_ref()
    }
}

/// Turn a Telegram message into an envelope.
/// Returns None for messages the relay never looks at: no sender (channel
/// posts), other bots, or no text/caption.
fn envelope_from_message(msg: &Message, me: &BotIdentity) -> Option<IncomingEnvelope> {
    let user = msg.from.as_ref()?;

    // Ignore bots to prevent loops, but allow anonymous admins.
    if user.is_bot && user.id.0 != ANONYMOUS_ADMIN_BOT_ID {
        return None;
    }

    let raw_text = msg.text().or_else(|| msg.caption())?;
    let is_direct = msg.chat.is_private();
    let mention = me.mention();
    let mentions_bot = !is_direct && contains_ignore_case(raw_text, &mention);
    let text = if is_direct {
        raw_text.trim().to_string()
    } else {
        strip_mention(raw_text, &mention)
    };

    let reply = msg.reply_to_message();
    let replies_to_bot = reply
        .and_then(|r| r.from.as_ref())
        .is_some_and(|author| author.id.0 == me.id);
    let reply_to_text = reply.map(|r| {
        r.text()
            .or_else(|| r.caption())
            .unwrap_or_default()
            .to_string()
    });

    Some(IncomingEnvelope {
        conversation_id: msg.chat.id.0,
        sender_id: i64::try_from(user.id.0).unwrap_or_default(),
        text,
        is_direct,
        mentions_bot,
        replies_to_bot,
        reply_to_text,
        forwarded_from: msg.forward_origin().map(forward_origin_name),
    })
}

/// Display name of a forward's origin; empty when Telegram hides it.
fn forward_origin_name(origin: &MessageOrigin) -> String {
    match origin {
        MessageOrigin::User { sender_user, .. } => sender_user.full_name(),
        MessageOrigin::HiddenUser {
            sender_user_name, ..
        } => sender_user_name.clone(),
        MessageOrigin::Chat { sender_chat, .. } => {
            sender_chat.title().unwrap_or_default().to_string()
        }
        MessageOrigin::Channel { chat, .. } => chat.title().unwrap_or_default().to_string(),
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack
        .to_lowercase()
        .contains(&needle.to_lowercase())
}

/// Remove every `@botname` mention, matching case-insensitively.
fn strip_mention(text: &str, mention: &str) -> String {
    let lower = text.to_lowercase();
    let needle = mention.to_lowercase();
    if needle.is_empty() || lower.len() != text.len() {
        // Case folding changed byte offsets; fall back to an exact match.
        return text.replace(mention, "").trim().to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (idx, _) in lower.match_indices(&needle) {
        out.push_str(&text[last..idx]);
        last = idx + needle.len();
    }
    out.push_str(&text[last..]);
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

async fn send_reply(bot: &Bot, chat_id: ChatId, text: &str) {
    for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_CHARS) {
        if let Err(e) = bot.send_message(chat_id, chunk).await {
            error!("failed to send telegram reply to chat {chat_id}: {e}");
            return;
        }
    }
}

async fn handle_message(bot: Bot, msg: Message, me: Arc<BotIdentity>, on_message: OnMessageFn) {
    let Some(envelope) = envelope_from_message(&msg, &me) else {
        return;
    };
    let chat_id = msg.chat.id;
    debug!(
        "telegram message from uid={} (chat {}): {} chars",
        envelope.sender_id,
        chat_id,
        envelope.text.chars().count()
    );

    let Some(work) = on_message(envelope) else {
        return;
    };

    let mut reply = tokio::spawn(work);
    let mut typing = tokio::time::interval(TYPING_REFRESH);
    let reply_text = loop {
        tokio::select! {
            result = &mut reply => {
                break match result {
                    Ok(text) => text,
                    Err(e) => {
                        error!("reply task for telegram chat {chat_id} failed: {e}");
                        return;
                    }
                };
            }
            _ = typing.tick() => {
                if let Err(e) = bot.send_chat_action(chat_id, ChatAction::Typing).await {
                    debug!("typing indicator failed: {e}");
                }
            }
        }
    };

    send_reply(&bot, chat_id, &reply_text).await;
}

#[async_trait]
impl Channel for TelegramChannel {
    fn channel_type(&self) -> &str {
        "telegram"
    }

    fn display_name(&self) -> &str {
        &self.display
    }

    async fn connect(&mut self) -> Result<()> {
        self.status = ChannelStatus::Connecting;
        let bot = Bot::new(&self.bot_token);

        let me = match bot.get_me().await {
            Ok(me) => me,
            Err(e) => {
                let msg = format!("telegram getMe failed: {e}");
                self.status = ChannelStatus::Error(msg.clone());
                return Err(Error::Channel(msg));
            }
        };
        let identity = BotIdentity {
            id: me.id.0,
            username: me.username().to_string(),
        };
        info!("telegram bot @{} (id {}) connected", identity.username, identity.id);

        let me = Arc::new(identity.clone());
        let on_message = Arc::clone(&self.on_message);
        let handler = Update::filter_message().endpoint(move |bot: Bot, msg: Message| {
            let me = Arc::clone(&me);
            let on_message = Arc::clone(&on_message);
            async move {
                handle_message(bot, msg, me, on_message).await;
                respond(())
            }
        });

        let mut dispatcher = Dispatcher::builder(bot, handler)
            .default_handler(|upd| async move {
                tracing::trace!("unhandled update: {:?}", upd.kind);
            })
            .build();
        self.shutdown = Some(dispatcher.shutdown_token());

        self.task = Some(tokio::spawn(async move {
            info!("telegram bot polling started");
            dispatcher.dispatch().await;
            info!("telegram bot polling stopped");
        }));

        self.identity = Some(identity);
        self.status = ChannelStatus::Connected;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(token) = self.shutdown.take() {
            match token.shutdown() {
                Ok(done) => done.await,
                Err(e) => warn!("telegram shutdown token error: {e:?}"),
            }
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("telegram dispatcher task ended abnormally: {e}");
            }
        }
        self.status = ChannelStatus::Disconnected;
        info!("telegram channel disconnected");
        Ok(())
    }

    fn status(&self) -> ChannelStatus {
        self.status.clone()
    }
}
