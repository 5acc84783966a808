use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relaybot_agents::{AgentRuntime, LlmProvider, LlmRequest, LlmResponse, ToolRegistry};
use relaybot_common::{ConversationId, Error, IncomingEnvelope, Result};
use relaybot_gateway::Relay;
use relaybot_gateway::relay::{AUTH_ERROR_TEXT, CLEARED_TEXT, EMPTY_REPLY_TEXT, ERROR_TEXT, WELCOME_TEXT};
use relaybot_security::Allowlist;
use relaybot_store::HistoryStore;

struct MockProvider {
    replies: Mutex<VecDeque<Result<LlmResponse>>>,
    calls: Arc<AtomicUsize>,
    last_user_text: Mutex<Option<String>>,
}

impl MockProvider {
    fn new(replies: Vec<Result<LlmResponse>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Arc::new(AtomicUsize::new(0)),
            last_user_text: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn provider_id(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-1"
    }

    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_user_text.lock().unwrap() = request.messages.last().map(|m| m.content.clone());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(LlmResponse::text("default reply")))
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

fn relay_with(provider: Arc<MockProvider>, allowlist: Allowlist) -> Arc<Relay> {
    let runtime = AgentRuntime::new(
        provider,
        ToolRegistry::new(Duration::from_secs(1)),
        Arc::new(HistoryStore::new(20)),
    );
    Arc::new(Relay::new(Arc::new(runtime), allowlist))
}

fn public_relay(provider: Arc<MockProvider>) -> Arc<Relay> {
    relay_with(provider, Allowlist::default())
}

#[tokio::test]
async fn direct_message_gets_the_model_reply() {
    let provider = Arc::new(MockProvider::new(vec![Ok(LlmResponse::text("Hi there!"))]));
    let relay = public_relay(provider.clone());

    let reply = relay.handle(IncomingEnvelope::direct(7, 7, "hello")).await;

    assert_eq!(reply.as_deref(), Some("Hi there!"));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unaddressed_group_chatter_is_ignored() {
    let provider = Arc::new(MockProvider::new(vec![]));
    let relay = public_relay(provider.clone());

    assert!(relay.dispatch(IncomingEnvelope::group(-5, 1, "lunch?")).is_none());
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

    let mentioned = IncomingEnvelope {
        mentions_bot: true,
        ..IncomingEnvelope::group(-5, 1, "what's for lunch?")
    };
    assert_eq!(relay.handle(mentioned).await.as_deref(), Some("default reply"));
}

#[tokio::test]
async fn forwarded_and_quoted_text_reaches_the_model() {
    let provider = Arc::new(MockProvider::new(vec![]));
    let relay = public_relay(provider.clone());

    let envelope = IncomingEnvelope {
        forwarded_from: Some("News Channel".into()),
        ..IncomingEnvelope::direct(7, 7, "verify claims")
    };
    relay.handle(envelope).await;

    assert_eq!(
        provider.last_user_text.lock().unwrap().as_deref(),
        Some("[Forwarded message from News Channel]\nverify claims")
    );
}

#[tokio::test]
async fn blank_messages_are_dropped() {
    let provider = Arc::new(MockProvider::new(vec![]));
    let relay = public_relay(provider.clone());

    assert!(relay.dispatch(IncomingEnvelope::direct(7, 7, "   ")).is_none());
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn commands_bypass_the_addressing_rule() {
    let provider = Arc::new(MockProvider::new(vec![]));
    let relay = public_relay(provider.clone());

    let reply = relay.handle(IncomingEnvelope::group(-5, 1, "/start")).await;
    assert_eq!(reply.as_deref(), Some(WELCOME_TEXT));

    let reply = relay.handle(IncomingEnvelope::direct(7, 7, "/help")).await;
    assert_eq!(reply.as_deref(), Some(WELCOME_TEXT));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn clear_and_reset_empty_the_history() {
    let provider = Arc::new(MockProvider::new(vec![]));
    let relay = public_relay(provider);
    let id = ConversationId::from(7);

    relay.handle(IncomingEnvelope::direct(7, 7, "remember this")).await;
    assert_eq!(relay.runtime().history().snapshot(&id).await.len(), 2);

    let reply = relay.handle(IncomingEnvelope::direct(7, 7, "/clear")).await;
    assert_eq!(reply.as_deref(), Some(CLEARED_TEXT));
    assert!(relay.runtime().history().snapshot(&id).await.is_empty());

    relay.handle(IncomingEnvelope::direct(7, 7, "again")).await;
    let reply = relay.handle(IncomingEnvelope::direct(7, 7, "/reset")).await;
    assert_eq!(reply.as_deref(), Some(CLEARED_TEXT));
    assert!(relay.runtime().history().snapshot(&id).await.is_empty());
}

#[tokio::test]
async fn commands_for_other_bots_are_not_ours() {
    let provider = Arc::new(MockProvider::new(vec![]));
    let relay = public_relay(provider);
    relay.set_bot_username("relay_bot");

    assert!(relay.dispatch(IncomingEnvelope::group(-5, 1, "/clear@other_bot")).is_none());
    let reply = relay.handle(IncomingEnvelope::group(-5, 1, "/clear@relay_bot")).await;
    assert_eq!(reply.as_deref(), Some(CLEARED_TEXT));
}

#[tokio::test]
async fn empty_model_reply_becomes_a_prompt_to_rephrase() {
    let provider = Arc::new(MockProvider::new(vec![Ok(LlmResponse::text(""))]));
    let relay = public_relay(provider);

    let reply = relay.handle(IncomingEnvelope::direct(7, 7, "hmm")).await;
    assert_eq!(reply.as_deref(), Some(EMPTY_REPLY_TEXT));
}

#[tokio::test]
async fn provider_failures_become_apologies() {
    let provider = Arc::new(MockProvider::new(vec![
        Err(Error::Provider("anthropic API error (status=529): overloaded".into())),
        Err(Error::ProviderAuth("invalid x-api-key".into())),
        Ok(LlmResponse::malformed("missing content")),
    ]));
    let relay = public_relay(provider);

    let reply = relay.handle(IncomingEnvelope::direct(7, 7, "one")).await;
    assert_eq!(reply.as_deref(), Some(ERROR_TEXT));

    let reply = relay.handle(IncomingEnvelope::direct(7, 7, "two")).await;
    assert_eq!(reply.as_deref(), Some(AUTH_ERROR_TEXT));

    let reply = relay.handle(IncomingEnvelope::direct(7, 7, "three")).await;
    assert_eq!(reply.as_deref(), Some(ERROR_TEXT));
}

#[tokio::test]
async fn allowlist_applies_to_messages_and_commands() {
    let provider = Arc::new(MockProvider::new(vec![]));
    let relay = relay_with(provider.clone(), Allowlist::new([7], [-100]));

    assert!(relay.dispatch(IncomingEnvelope::direct(8, 8, "hello")).is_none());
    assert!(relay.dispatch(IncomingEnvelope::direct(8, 8, "/start")).is_none());
    assert!(relay.dispatch(IncomingEnvelope::group(-5, 7, "/start")).is_none());
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

    assert_eq!(
        relay.handle(IncomingEnvelope::direct(7, 7, "hello")).await.as_deref(),
        Some("default reply")
    );
    let mentioned = IncomingEnvelope {
        mentions_bot: true,
        ..IncomingEnvelope::group(-100, 42, "hi all")
    };
    assert!(relay.handle(mentioned).await.is_some());
}

#[tokio::test]
async fn on_message_fn_defers_work_until_polled() {
    let provider = Arc::new(MockProvider::new(vec![]));
    let relay = public_relay(provider.clone());
    let on_message = relay.on_message_fn();

    let work = on_message(IncomingEnvelope::direct(7, 7, "hello")).expect("accepted");
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    assert_eq!(work.await, "default reply");
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}
