pub mod history_store;

pub use history_store::{ConversationGuard, HistoryStore, MIN_HISTORY_MESSAGES};
