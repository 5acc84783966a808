use std::collections::HashSet;

use tracing::warn;

/// Outcome of an access check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    DeniedUser,
    DeniedGroup,
}

impl AccessDecision {
    pub fn is_allowed(self) -> bool {
        self == AccessDecision::Allowed
    }
}

/// Static allowlist keyed by Telegram ids.
///
/// With both lists empty every chat is allowed. Otherwise group chats
/// (negative chat ids) must be listed in `allowed_groups` and direct chats
/// need the sender in `allowed_users`.
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    users: HashSet<i64>,
    groups: HashSet<i64>,
}

impl Allowlist {
    pub fn new(
        users: impl IntoIterator<Item = i64>,
        groups: impl IntoIterator<Item = i64>,
    ) -> Self {
        Self {
            users: users.into_iter().collect(),
            groups: groups.into_iter().collect(),
        }
    }

    pub fn is_public(&self) -> bool {
        self.users.is_empty() && self.groups.is_empty()
    }

    pub fn check(&self, chat_id: i64, sender_id: i64) -> AccessDecision {
        if self.is_public() {
            return AccessDecision::Allowed;
        }
        if chat_id < 0 {
            if self.groups.contains(&chat_id) {
                AccessDecision::Allowed
            } else {
                warn!(chat_id, "unauthorized group access attempt");
                AccessDecision::DeniedGroup
            }
        } else if self.users.contains(&sender_id) {
            AccessDecision::Allowed
        } else {
            warn!(sender_id, "unauthorized user access attempt");
            AccessDecision::DeniedUser
        }
    }

    pub fn is_allowed(&self, chat_id: i64, sender_id: i64) -> bool {
        self.check(chat_id, sender_id).is_allowed()
    }
}
