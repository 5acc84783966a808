pub mod intake;
pub mod telegram_fmt;
pub mod traits;

#[cfg(feature = "telegram")]
pub mod telegram;

pub use intake::{Command, parse_command, resolve_content, should_respond};
pub use telegram_fmt::{TELEGRAM_MAX_MESSAGE_CHARS, split_message};
pub use traits::{Channel, ChannelStatus, OnMessageFn};

#[cfg(feature = "telegram")]
pub use telegram::TelegramChannel;
