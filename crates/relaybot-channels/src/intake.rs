//! Platform-independent rules deciding whether and with what text the bot
//! answers an inbound message.

use relaybot_common::IncomingEnvelope;

/// Direct chats always get an answer; in groups the bot must be mentioned or
/// replied to.
pub fn should_respond(envelope: &IncomingEnvelope) -> bool {
    envelope.is_direct || envelope.mentions_bot || envelope.replies_to_bot
}

/// Build the user turn from an envelope: forward marker, quoted reply, then
/// the text itself. Returns `None` when nothing but whitespace remains.
pub fn resolve_content(envelope: &IncomingEnvelope) -> Option<String> {
    let mut parts = Vec::new();

    match envelope.forwarded_from.as_deref().map(str::trim) {
        Some("") => parts.push("[Forwarded message]".to_string()),
        Some(origin) => parts.push(format!("[Forwarded message from {origin}]")),
        None => {}
    }

    if let Some(replied) = &envelope.reply_to_text {
        let replied = replied.trim();
        if replied.is_empty() {
            parts.push("[Replying to: [No text]]".to_string());
        } else {
            parts.push(format!("[Replying to: {replied}]"));
        }
    }

    let text = envelope.text.trim();
    if text.is_empty() && parts.is_empty() {
        return None;
    }
    if !text.is_empty() {
        parts.push(text.to_string());
    }
    Some(parts.join("\n"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Clear,
    Reset,
}

/// Recognise a bot command at the start of `text`.
///
/// `/cmd@name` is accepted only when `name` is this bot; commands addressed to
/// other bots in the same group are ignored.
pub fn parse_command(text: &str, bot_username: Option<&str>) -> Option<Command> {
    let token = text.trim_start().split_whitespace().next()?;
    let command = token.strip_prefix('/')?;

    let (name, target) = match command.split_once('@') {
        Some((name, target)) => (name, Some(target)),
        None => (command, None),
    };
    if let (Some(target), Some(me)) = (target, bot_username) {
        if !target.eq_ignore_ascii_case(me.trim_start_matches('@')) {
            return None;
        }
    }

    match name.to_ascii_lowercase().as_str() {
        "start" => Some(Command::Start),
        "help" => Some(Command::Help),
        "clear" => Some(Command::Clear),
        "reset" => Some(Command::Reset),
        _ => None,
    }
}
