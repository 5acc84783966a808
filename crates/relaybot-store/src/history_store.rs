use std::sync::Arc;

use dashmap::DashMap;
use relaybot_common::{ChatMessage, ChatRole, ConversationId};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Smallest usable window: a system prompt plus the newest message.
pub const MIN_HISTORY_MESSAGES: usize = 2;

type Slot = Arc<Mutex<Vec<ChatMessage>>>;

/// Bounded, in-memory conversation histories keyed by conversation id.
///
/// Each conversation sits behind its own async mutex. Callers take the lock
/// for a whole turn through [`HistoryStore::lock`], so two messages for the
/// same conversation are processed one after the other while different
/// conversations proceed in parallel.
pub struct HistoryStore {
    max_messages: usize,
    conversations: DashMap<ConversationId, Slot>,
}

impl HistoryStore {
    pub fn new(max_messages: usize) -> Self {
        Self {
            max_messages: max_messages.max(MIN_HISTORY_MESSAGES),
            conversations: DashMap::new(),
        }
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    /// Number of conversations seen since startup.
    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }

    fn slot(&self, id: &ConversationId) -> Slot {
        // Clone the Arc out so the shard lock is released before awaiting.
        self.conversations
            .entry(id.clone())
            .or_default()
            .value()
            .clone()
    }

    /// Acquire exclusive access to one conversation, creating it if needed.
    pub async fn lock(&self, id: &ConversationId) -> ConversationGuard {
        let messages = self.slot(id).lock_owned().await;
        ConversationGuard {
            id: id.clone(),
            messages,
            max_messages: self.max_messages,
            turn_start: None,
        }
    }

    /// Discard all context for a conversation.
    pub async fn reset(&self, id: &ConversationId) {
        let mut conversation = self.lock(id).await;
        conversation.clear();
    }

    /// Copy of the current history.
    pub async fn snapshot(&self, id: &ConversationId) -> Vec<ChatMessage> {
        self.lock(id).await.messages().to_vec()
    }
}

/// Exclusive handle on one conversation history. The lock is released on drop.
///
/// Between [`begin_turn`](Self::begin_turn) and [`end_turn`](Self::end_turn)
/// the messages of the turn in progress are never evicted, so a tool request
/// and its results always reach the provider together. Older exchanges still
/// make room; the window is enforced in full once the turn ends.
pub struct ConversationGuard {
    id: ConversationId,
    messages: OwnedMutexGuard<Vec<ChatMessage>>,
    max_messages: usize,
    turn_start: Option<usize>,
}

impl ConversationGuard {
    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        if self.turn_start.is_some() {
            self.turn_start = Some(0);
        }
    }

    /// Mark the next appended message as the start of a turn.
    pub fn begin_turn(&mut self) {
        self.turn_start = Some(self.messages.len());
    }

    /// Close the current turn and trim the window back to its bound. Also
    /// runs when the guard is dropped mid-turn.
    pub fn end_turn(&mut self) {
        if self.turn_start.take().is_some() {
            let evicted = trim_history(&mut self.messages, self.max_messages);
            self.log_eviction(evicted);
        }
    }

    /// Append a message and evict the oldest messages until the window fits
    /// again, leaving the turn in progress untouched.
    pub fn append(&mut self, message: ChatMessage) {
        self.messages.push(message);
        let evicted = match self.turn_start {
            Some(start) => {
                let evicted = evict_exchanges(&mut self.messages, self.max_messages, start);
                self.turn_start = Some(start - evicted);
                evicted
            }
            None => trim_history(&mut self.messages, self.max_messages),
        };
        self.log_eviction(evicted);
    }

    fn log_eviction(&self, evicted: usize) {
        if evicted > 0 {
            debug!(conversation = %self.id, evicted, "trimmed conversation history");
        }
    }
}

impl Drop for ConversationGuard {
    fn drop(&mut self) {
        self.end_turn();
    }
}

/// End of the exchange starting at `start`: the next user message, or the
/// end of the history.
fn exchange_end(messages: &[ChatMessage], start: usize) -> usize {
    messages[start + 1..]
        .iter()
        .position(|m| m.role == ChatRole::User)
        .map_or(messages.len(), |offset| start + 1 + offset)
}

/// Drop whole exchanges (a user message and everything answering it) from the
/// front while over `max`, never touching anything at or after `keep_from`.
/// Returns the number of evicted messages.
fn evict_exchanges(messages: &mut Vec<ChatMessage>, max: usize, keep_from: usize) -> usize {
    let mut evicted = 0;
    while messages.len() > max {
        let Some(start) = messages.iter().position(|m| !m.is_system()) else {
            break;
        };
        if start >= keep_from - evicted {
            break;
        }
        let end = exchange_end(messages, start).min(keep_from - evicted);
        messages.drain(start..end);
        evicted += end - start;
    }
    evicted
}

/// Enforce `messages.len() <= max`, keeping system messages. Older exchanges
/// go first, then the tool traffic of the newest one, and only then single
/// messages from the front. A tool result never outlives its request.
/// Returns the number of evicted messages.
fn trim_history(messages: &mut Vec<ChatMessage>, max: usize) -> usize {
    if messages.len() <= max {
        return 0;
    }

    let newest = messages
        .iter()
        .rposition(|m| m.role == ChatRole::User)
        .unwrap_or(0);
    let mut evicted = evict_exchanges(messages, max, newest);

    if messages.len() > max {
        let before = messages.len();
        messages.retain(|m| !m.has_tool_calls() && m.role != ChatRole::Tool);
        evicted += before - messages.len();
    }

    while messages.len() > max {
        let Some(oldest) = messages.iter().position(|m| !m.is_system()) else {
            break;
        };
        messages.remove(oldest);
        evicted += 1;
    }

    evicted
}
