use std::sync::Arc;
use std::time::Duration;

use relaybot_common::{ChatMessage, ConversationId, Error, Result, ToolCall};
use relaybot_store::{ConversationGuard, HistoryStore};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::providers::{FinishReason, LlmProvider, LlmRequest, LlmResponse, ToolDefinition};
use crate::tools::video_transcript::{VIDEO_TOOL_NAME, find_video_urls};
use crate::tools::{ToolErrorKind, ToolRegistry, ToolResult};

const ITERATION_LIMIT_REPLY: &str =
    "I encountered an issue processing your request. Please try again.";
const DEADLINE_REPLY: &str =
    "Sorry, that took too long to answer. Please try again in a moment.";
const LINKED_VIDEO_MARKER: &str = "[Linked video]";

/// Bounds applied to every turn.
#[derive(Debug, Clone)]
pub struct RuntimeLimits {
    /// Maximum provider invocations per incoming message.
    pub max_iterations: usize,
    /// Wall-clock budget for one incoming message.
    pub turn_timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            turn_timeout: Duration::from_secs(120),
            max_tokens: 4096,
            temperature: 0.7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Completed,
    IterationLimit,
    DeadlineExceeded,
}

/// The reply produced for one incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReply {
    pub text: String,
    pub status: TurnStatus,
    pub provider_calls: usize,
}

enum LoopState {
    AwaitingProvider,
    ExecutingTools(LlmResponse),
    Done(TurnReply),
}

/// Drives the provider/tool loop for each incoming message against the
/// conversation history.
pub struct AgentRuntime {
    provider: Arc<dyn LlmProvider>,
    tools: ToolRegistry,
    history: Arc<HistoryStore>,
    limits: RuntimeLimits,
    system_prompt: Option<String>,
    auto_video_context: bool,
}

impl AgentRuntime {
    pub fn new(provider: Arc<dyn LlmProvider>, tools: ToolRegistry, history: Arc<HistoryStore>) -> Self {
        info!(
            "agent runtime using {} ({}) with tools {:?}",
            provider.provider_id(),
            provider.model(),
            tools.names()
        );
        Self {
            provider,
            tools,
            history,
            limits: RuntimeLimits::default(),
            system_prompt: None,
            auto_video_context: false,
        }
    }

    pub fn with_limits(mut self, limits: RuntimeLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    pub fn with_auto_video_context(mut self, enabled: bool) -> Self {
        self.auto_video_context = enabled;
        self
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn limits(&self) -> &RuntimeLimits {
        &self.limits
    }

    pub async fn health_check(&self) -> Result<bool> {
        self.provider.health_check().await
    }

    /// Forget everything said in a conversation.
    pub async fn reset(&self, conversation_id: &ConversationId) {
        self.history.reset(conversation_id).await;
        info!(conversation = %conversation_id, "conversation reset");
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        if self.provider.supports_tool_calling() {
            self.tools.definitions()
        } else {
            Vec::new()
        }
    }

    /// Run one user message through the provider/tool loop.
    ///
    /// The conversation stays locked for the whole turn, so messages for the
    /// same conversation are answered strictly one after another.
    #[instrument(skip(self, conversation_id, text), fields(provider = %self.provider.provider_id(), conversation = %conversation_id))]
    pub async fn process_message(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<TurnReply> {
        let deadline = Instant::now() + self.limits.turn_timeout;
        let mut conversation = self.history.lock(conversation_id).await;

        if conversation.is_empty() {
            if let Some(prompt) = &self.system_prompt {
                conversation.append(ChatMessage::system(prompt.clone()));
            }
        }

        let content = self.attach_video_context(text, deadline).await;
        conversation.begin_turn();
        conversation.append(ChatMessage::user(content));

        let tool_defs = self.tool_definitions();
        let tools_enabled = !tool_defs.is_empty();
        let mut provider_calls = 0usize;
        let mut last_text: Option<String> = None;
        let mut state = LoopState::AwaitingProvider;

        loop {
            state = match state {
                LoopState::AwaitingProvider => {
                    if provider_calls >= self.limits.max_iterations {
                        warn!(provider_calls, "tool loop hit the iteration limit");
                        let text = last_text
                            .take()
                            .unwrap_or_else(|| ITERATION_LIMIT_REPLY.to_string());
                        LoopState::Done(finish(
                            &mut conversation,
                            text,
                            TurnStatus::IterationLimit,
                            provider_calls,
                        ))
                    } else if Instant::now() >= deadline {
                        LoopState::Done(deadline_reply(&mut conversation, provider_calls))
                    } else {
                        let request = LlmRequest {
                            messages: conversation.messages().to_vec(),
                            tools: tool_defs.clone(),
                            max_tokens: self.limits.max_tokens,
                            temperature: self.limits.temperature,
                        };
                        provider_calls += 1;
                        debug!(call = provider_calls, messages = request.messages.len(), "calling provider");

                        match tokio::time::timeout_at(deadline, self.provider.generate(&request)).await {
                            Err(_) => {
                                warn!("provider call outlived the turn deadline");
                                LoopState::Done(deadline_reply(&mut conversation, provider_calls))
                            }
                            Ok(response) => {
                                let response = response?;
                                if response.finish_reason == FinishReason::Error {
                                    return Err(Error::MalformedResponse(response.text));
                                }
                                if let Some(usage) = &response.usage {
                                    debug!(
                                        input_tokens = usage.input_tokens,
                                        output_tokens = usage.output_tokens,
                                        "provider usage"
                                    );
                                }
                                if !response.text.trim().is_empty() {
                                    last_text = Some(response.text.clone());
                                }

                                if tools_enabled && response.wants_tools() {
                                    LoopState::ExecutingTools(response)
                                } else {
                                    if response.finish_reason == FinishReason::Length {
                                        warn!("provider reply was cut off at max_tokens");
                                    }
                                    LoopState::Done(finish(
                                        &mut conversation,
                                        response.text,
                                        TurnStatus::Completed,
                                        provider_calls,
                                    ))
                                }
                            }
                        }
                    }
                }
                LoopState::ExecutingTools(response) => {
                    info!(count = response.tool_calls.len(), "provider requested tools");
                    conversation.append(ChatMessage::assistant_with_tool_calls(
                        response.text,
                        response.tool_calls.clone(),
                    ));

                    for call in &response.tool_calls {
                        let result = self.run_tool(call, deadline).await;
                        conversation.append(ChatMessage::tool_result(
                            call.id.clone(),
                            call.name.clone(),
                            result.into_content(),
                        ));
                    }

                    if Instant::now() >= deadline {
                        LoopState::Done(deadline_reply(&mut conversation, provider_calls))
                    } else {
                        LoopState::AwaitingProvider
                    }
                }
                LoopState::Done(reply) => {
                    info!(
                        status = ?reply.status,
                        provider_calls = reply.provider_calls,
                        chars = reply.text.chars().count(),
                        "turn finished"
                    );
                    return Ok(reply);
                }
            };
        }
    }

    async fn run_tool(&self, call: &ToolCall, deadline: Instant) -> ToolResult {
        let now = Instant::now();
        if now >= deadline {
            return ToolResult::failure(
                ToolErrorKind::Timeout,
                format!("skipped {}: the turn ran out of time", call.name),
            );
        }
        info!(tool = %call.name, id = %call.id, "executing tool");
        let result = self.tools.execute_within(call, deadline - now).await;
        if let ToolResult::Failure { kind, message } = &result {
            warn!(tool = %call.name, %kind, "tool failed: {message}");
        }
        result
    }

    /// Append details of linked videos to the user's text.
    async fn attach_video_context(&self, text: &str, deadline: Instant) -> String {
        if !self.auto_video_context || self.tools.get(VIDEO_TOOL_NAME).is_none() {
            return text.to_string();
        }

        let mut content = text.to_string();
        for (idx, url) in find_video_urls(text).into_iter().enumerate() {
            let call = ToolCall {
                id: format!("linked_video_{idx}"),
                name: VIDEO_TOOL_NAME.to_string(),
                arguments: json!({ "url": url }),
            };
            match self.run_tool(&call, deadline).await {
                ToolResult::Success(details) => {
                    content.push_str(&format!("\n\n{LINKED_VIDEO_MARKER}\n{details}"));
                }
                ToolResult::Failure { .. } => debug!(%url, "skipping linked video context"),
            }
        }
        content
    }
}

fn finish(
    conversation: &mut ConversationGuard,
    text: String,
    status: TurnStatus,
    provider_calls: usize,
) -> TurnReply {
    conversation.append(ChatMessage::assistant(text.clone()));
    conversation.end_turn();
    TurnReply {
        text,
        status,
        provider_calls,
    }
}

fn deadline_reply(conversation: &mut ConversationGuard, provider_calls: usize) -> TurnReply {
    warn!(provider_calls, "turn deadline exceeded");
    finish(
        conversation,
        DEADLINE_REPLY.to_string(),
        TurnStatus::DeadlineExceeded,
        provider_calls,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::Tool;
    use async_trait::async_trait;
    use relaybot_common::ChatRole;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted responses; repeats the last one when the script runs out.
    struct ScriptedProvider {
        script: Mutex<VecDeque<Result<LlmResponse>>>,
        fallback: fn() -> LlmResponse,
        calls: AtomicUsize,
        requests: Mutex<Vec<LlmRequest>>,
        tools: bool,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<LlmResponse>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback: || LlmResponse::text("fallback"),
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
                tools: true,
            }
        }

        fn always(fallback: fn() -> LlmResponse) -> Self {
            Self {
                fallback,
                ..Self::new(Vec::new())
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn request(&self, idx: usize) -> LlmRequest {
            self.requests.lock().unwrap()[idx].clone()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn provider_id(&self) -> &str {
            "scripted"
        }

        fn model(&self) -> &str {
            "scripted-1"
        }

        fn supports_tool_calling(&self) -> bool {
            self.tools
        }

        async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok((self.fallback)()))
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
    }

    struct StubTool {
        name: &'static str,
        output: &'static str,
        delay: Duration,
        runs: Arc<AtomicUsize>,
    }

    impl StubTool {
        fn new(name: &'static str, output: &'static str) -> Self {
            Self {
                name,
                output,
                delay: Duration::ZERO,
                runs: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl Tool for StubTool {
        fn name(&self) -> &'static str {
            self.name
        }

        fn description(&self) -> &'static str {
            "stub"
        }

        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(&self, _input: &Value) -> ToolResult {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            ToolResult::success(self.output)
        }
    }

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: json!({"query": "rust"}),
        }
    }

    fn runtime_with(
        provider: Arc<ScriptedProvider>,
        tools: Vec<StubTool>,
        tool_timeout: Duration,
    ) -> AgentRuntime {
        let mut registry = ToolRegistry::new(tool_timeout);
        for tool in tools {
            registry.register(Arc::new(tool));
        }
        AgentRuntime::new(provider, registry, Arc::new(HistoryStore::new(20)))
    }

    fn roles(history: &[ChatMessage]) -> Vec<ChatRole> {
        history.iter().map(|m| m.role).collect()
    }

    fn id() -> ConversationId {
        ConversationId::from(42)
    }

    #[tokio::test]
    async fn plain_reply_without_tools() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(LlmResponse::text("Hi there!"))]));
        let runtime = runtime_with(provider.clone(), vec![], Duration::from_secs(1));

        let reply = runtime.process_message(&id(), "hello").await.unwrap();

        assert_eq!(reply.text, "Hi there!");
        assert_eq!(reply.status, TurnStatus::Completed);
        assert_eq!(reply.provider_calls, 1);
        let history = runtime.history().snapshot(&id()).await;
        assert_eq!(roles(&history), [ChatRole::User, ChatRole::Assistant]);
        assert_eq!(history[0].content, "hello");
        assert_eq!(history[1].content, "Hi there!");
    }

    #[tokio::test]
    async fn search_result_sits_between_request_and_answer() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(LlmResponse::tool_calls("", vec![call("c1", "search_web")])),
            Ok(LlmResponse::text("Rust 1.85 shipped edition 2024.")),
        ]));
        let runtime = runtime_with(
            provider.clone(),
            vec![StubTool::new("search_web", "1. **Rust blog**")],
            Duration::from_secs(1),
        );

        let reply = runtime.process_message(&id(), "latest rust news?").await.unwrap();

        assert_eq!(reply.text, "Rust 1.85 shipped edition 2024.");
        assert_eq!(reply.provider_calls, 2);
        let history = runtime.history().snapshot(&id()).await;
        assert_eq!(
            roles(&history),
            [ChatRole::User, ChatRole::Assistant, ChatRole::Tool, ChatRole::Assistant]
        );
        assert_eq!(history[1].tool_calls[0].id, "c1");
        assert_eq!(history[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(history[2].name.as_deref(), Some("search_web"));
        assert_eq!(history[2].content, "1. **Rust blog**");

        // The second request carries the tool result and the schema.
        let second = provider.request(1);
        assert_eq!(second.messages.len(), 3);
        assert_eq!(second.tools.len(), 1);
        assert_eq!(second.tools[0].name, "search_web");
    }

    #[tokio::test]
    async fn iteration_cap_bounds_provider_calls() {
        let provider = Arc::new(ScriptedProvider::always(|| {
            LlmResponse::tool_calls("still looking", vec![call("again", "search_web")])
        }));
        let runtime = runtime_with(
            provider.clone(),
            vec![StubTool::new("search_web", "nothing new")],
            Duration::from_secs(1),
        )
        .with_limits(RuntimeLimits {
            max_iterations: 3,
            ..RuntimeLimits::default()
        });

        let reply = runtime.process_message(&id(), "loop forever").await.unwrap();

        assert_eq!(provider.calls(), 3);
        assert_eq!(reply.provider_calls, 3);
        assert_eq!(reply.status, TurnStatus::IterationLimit);
        assert_eq!(reply.text, "still looking");
        let history = runtime.history().snapshot(&id()).await;
        assert_eq!(history.last().unwrap().content, "still looking");
        let tool_messages = history.iter().filter(|m| m.role == ChatRole::Tool).count();
        assert_eq!(tool_messages, 3);
    }

    #[tokio::test]
    async fn iteration_cap_without_text_uses_generic_reply() {
        let provider = Arc::new(ScriptedProvider::always(|| {
            LlmResponse::tool_calls("", vec![call("again", "search_web")])
        }));
        let runtime = runtime_with(
            provider,
            vec![StubTool::new("search_web", "nothing")],
            Duration::from_secs(1),
        )
        .with_limits(RuntimeLimits {
            max_iterations: 1,
            ..RuntimeLimits::default()
        });

        let reply = runtime.process_message(&id(), "hm").await.unwrap();
        assert_eq!(reply.text, ITERATION_LIMIT_REPLY);
    }

    #[tokio::test]
    async fn unknown_tool_yields_failure_and_loop_continues() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(LlmResponse::tool_calls("", vec![call("c1", "launch_rockets")])),
            Ok(LlmResponse::text("I can't do that.")),
        ]));
        let runtime = runtime_with(
            provider.clone(),
            vec![StubTool::new("search_web", "x")],
            Duration::from_secs(1),
        );

        let reply = runtime.process_message(&id(), "launch").await.unwrap();

        assert_eq!(reply.text, "I can't do that.");
        assert_eq!(provider.calls(), 2);
        let history = runtime.history().snapshot(&id()).await;
        assert!(history[2].content.contains("unknown_tool"));
        assert_eq!(history[2].tool_call_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn timed_out_tool_is_reported_and_provider_called_again() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(LlmResponse::tool_calls("", vec![call("c1", "fetch_url")])),
            Ok(LlmResponse::text("The page did not load.")),
        ]));
        let runtime = runtime_with(
            provider.clone(),
            vec![StubTool::new("fetch_url", "late").slow(Duration::from_secs(5))],
            Duration::from_millis(20),
        );

        let reply = runtime.process_message(&id(), "read it").await.unwrap();

        assert_eq!(reply.status, TurnStatus::Completed);
        assert_eq!(provider.calls(), 2);
        let history = runtime.history().snapshot(&id()).await;
        assert_eq!(history[2].role, ChatRole::Tool);
        assert!(history[2].content.starts_with("Error (timeout)"));
    }

    #[tokio::test]
    async fn every_call_in_a_batch_gets_exactly_one_result_in_order() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(LlmResponse::tool_calls(
                "checking",
                vec![call("a", "search_web"), call("b", "missing"), call("c", "search_web")],
            )),
            Ok(LlmResponse::text("done")),
        ]));
        let runtime = runtime_with(
            provider,
            vec![StubTool::new("search_web", "ok")],
            Duration::from_secs(1),
        );

        runtime.process_message(&id(), "go").await.unwrap();

        let history = runtime.history().snapshot(&id()).await;
        let ids: Vec<_> = history
            .iter()
            .filter(|m| m.role == ChatRole::Tool)
            .map(|m| m.tool_call_id.clone().unwrap())
            .collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(history[1].content, "checking");
    }

    #[tokio::test]
    async fn deadline_skips_remaining_calls_but_keeps_pairing() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(LlmResponse::tool_calls(
            "",
            vec![call("a", "slow"), call("b", "slow")],
        ))]));
        let slow = StubTool::new("slow", "done").slow(Duration::from_secs(5));
        let runs = slow.runs.clone();
        let runtime = runtime_with(provider.clone(), vec![slow], Duration::from_secs(30))
            .with_limits(RuntimeLimits {
                turn_timeout: Duration::from_millis(50),
                ..RuntimeLimits::default()
            });

        let reply = runtime.process_message(&id(), "slowly").await.unwrap();

        assert_eq!(reply.status, TurnStatus::DeadlineExceeded);
        assert_eq!(reply.text, DEADLINE_REPLY);
        assert_eq!(provider.calls(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let history = runtime.history().snapshot(&id()).await;
        assert_eq!(
            roles(&history),
            [
                ChatRole::User,
                ChatRole::Assistant,
                ChatRole::Tool,
                ChatRole::Tool,
                ChatRole::Assistant
            ]
        );
        assert!(history[3].content.contains("skipped"));
    }

    #[tokio::test]
    async fn malformed_response_fails_the_turn() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(LlmResponse::malformed(
            "missing content",
        ))]));
        let runtime = runtime_with(provider, vec![], Duration::from_secs(1));

        let err = runtime.process_message(&id(), "hi").await.unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(ref m) if m == "missing content"));
    }

    #[tokio::test]
    async fn provider_errors_propagate() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err(Error::ProviderAuth(
            "invalid x-api-key".into(),
        ))]));
        let runtime = runtime_with(provider, vec![], Duration::from_secs(1));

        let err = runtime.process_message(&id(), "hi").await.unwrap_err();
        assert!(matches!(err, Error::ProviderAuth(_)));
        let history = runtime.history().snapshot(&id()).await;
        assert_eq!(roles(&history), [ChatRole::User]);
    }

    #[tokio::test]
    async fn tool_calls_are_ignored_when_provider_lacks_support() {
        let mut scripted = ScriptedProvider::new(vec![Ok(LlmResponse::tool_calls(
            "Here is what I know.",
            vec![call("c1", "search_web")],
        ))]);
        scripted.tools = false;
        let provider = Arc::new(scripted);
        let runtime = runtime_with(
            provider.clone(),
            vec![StubTool::new("search_web", "x")],
            Duration::from_secs(1),
        );

        let reply = runtime.process_message(&id(), "hi").await.unwrap();

        assert_eq!(reply.text, "Here is what I know.");
        assert!(provider.request(0).tools.is_empty());
        let history = runtime.history().snapshot(&id()).await;
        assert_eq!(roles(&history), [ChatRole::User, ChatRole::Assistant]);
    }

    #[tokio::test]
    async fn empty_final_text_is_returned_as_is() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(LlmResponse::text(""))]));
        let runtime = runtime_with(provider, vec![], Duration::from_secs(1));

        let reply = runtime.process_message(&id(), "...").await.unwrap();
        assert_eq!(reply.text, "");
        assert_eq!(reply.status, TurnStatus::Completed);
    }

    #[tokio::test]
    async fn system_prompt_is_added_once_and_survives_reset() {
        let provider = Arc::new(ScriptedProvider::always(|| LlmResponse::text("ok")));
        let runtime = runtime_with(provider, vec![], Duration::from_secs(1))
            .with_system_prompt(Some("be brief".into()));

        runtime.process_message(&id(), "one").await.unwrap();
        runtime.process_message(&id(), "two").await.unwrap();
        let history = runtime.history().snapshot(&id()).await;
        assert_eq!(history.iter().filter(|m| m.is_system()).count(), 1);
        assert_eq!(history.len(), 5);

        runtime.reset(&id()).await;
        runtime.process_message(&id(), "three").await.unwrap();
        let history = runtime.history().snapshot(&id()).await;
        assert_eq!(
            roles(&history),
            [ChatRole::System, ChatRole::User, ChatRole::Assistant]
        );
        assert_eq!(history[1].content, "three");
    }

    /// Every tool result follows the assistant message that requested it, and
    /// every requested call has its result.
    fn assert_paired(messages: &[ChatMessage]) {
        for (idx, message) in messages.iter().enumerate() {
            if message.role == ChatRole::Tool {
                let id = message.tool_call_id.as_deref().unwrap();
                assert!(
                    messages[..idx]
                        .iter()
                        .any(|m| m.tool_calls.iter().any(|c| c.id == id)),
                    "tool result {id} has no request before it"
                );
            }
            for call in &message.tool_calls {
                assert!(
                    messages[idx + 1..]
                        .iter()
                        .any(|m| m.tool_call_id.as_deref() == Some(call.id.as_str())),
                    "tool call {} has no result",
                    call.id
                );
            }
        }
    }

    fn small_window_runtime(provider: Arc<ScriptedProvider>) -> AgentRuntime {
        let mut registry = ToolRegistry::new(Duration::from_secs(1));
        registry.register(Arc::new(StubTool::new("search_web", "r")));
        AgentRuntime::new(provider, registry, Arc::new(HistoryStore::new(4)))
            .with_system_prompt(Some("sys".into()))
    }

    #[tokio::test]
    async fn batch_larger_than_the_window_reaches_the_provider_whole() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(LlmResponse::tool_calls(
                "",
                vec![
                    call("c0", "search_web"),
                    call("c1", "search_web"),
                    call("c2", "search_web"),
                ],
            )),
            Ok(LlmResponse::text("final")),
        ]));
        let runtime = small_window_runtime(provider.clone());

        let reply = runtime.process_message(&id(), "compare").await.unwrap();
        assert_eq!(reply.text, "final");

        let second = provider.request(1);
        assert_eq!(
            roles(&second.messages),
            [
                ChatRole::System,
                ChatRole::User,
                ChatRole::Assistant,
                ChatRole::Tool,
                ChatRole::Tool,
                ChatRole::Tool,
            ]
        );
        assert_eq!(second.messages[1].content, "compare");
        assert_paired(&second.messages);

        // Once the turn is over the window is back within bounds.
        let history = runtime.history().snapshot(&id()).await;
        assert!(history.len() <= 4);
        assert_eq!(
            roles(&history),
            [ChatRole::System, ChatRole::User, ChatRole::Assistant]
        );
        assert_eq!(history[2].content, "final");
    }

    #[tokio::test]
    async fn long_tool_turns_keep_the_question_and_pairing() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(LlmResponse::text("first answer")),
            Ok(LlmResponse::tool_calls("", vec![call("x0", "search_web")])),
            Ok(LlmResponse::tool_calls("", vec![call("x1", "search_web")])),
            Ok(LlmResponse::tool_calls("", vec![call("x2", "search_web")])),
            Ok(LlmResponse::text("second answer")),
        ]));
        let runtime = small_window_runtime(provider.clone());

        runtime.process_message(&id(), "warm up").await.unwrap();
        runtime.process_message(&id(), "go").await.unwrap();

        assert_eq!(provider.calls(), 5);
        // The first request of the turn still fits the earlier exchange.
        assert_eq!(provider.request(1).messages.len(), 4);
        for idx in 2..provider.calls() {
            let request = provider.request(idx);
            assert!(request.messages[0].is_system());
            assert_eq!(request.messages[1].role, ChatRole::User);
            assert_eq!(request.messages[1].content, "go");
            assert_paired(&request.messages);
        }
        // Older exchanges make room before the turn in progress is touched.
        assert!(
            provider
                .request(2)
                .messages
                .iter()
                .all(|m| m.content != "warm up")
        );

        let history = runtime.history().snapshot(&id()).await;
        assert!(history.len() <= 4);
        assert_eq!(history.last().unwrap().content, "second answer");
        assert_paired(&history);
    }

    #[tokio::test]
    async fn linked_videos_are_folded_into_the_user_message() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(LlmResponse::text("Nice video"))]));
        let runtime = runtime_with(
            provider.clone(),
            vec![StubTool::new(VIDEO_TOOL_NAME, "**YouTube Video: Demo**")],
            Duration::from_secs(1),
        )
        .with_auto_video_context(true);

        runtime
            .process_message(&id(), "thoughts? https://youtu.be/dQw4w9WgXcQ")
            .await
            .unwrap();

        let first = provider.request(0);
        assert_eq!(first.messages.len(), 1);
        assert_eq!(
            first.messages[0].content,
            "thoughts? https://youtu.be/dQw4w9WgXcQ\n\n[Linked video]\n**YouTube Video: Demo**"
        );
    }

    #[tokio::test]
    async fn concurrent_turns_on_one_conversation_do_not_interleave() {
        let provider = Arc::new(ScriptedProvider::always(|| LlmResponse::text("answer")));
        let slow = StubTool::new("search_web", "r").slow(Duration::from_millis(5));
        let runtime = Arc::new(runtime_with(provider, vec![slow], Duration::from_secs(1)));

        let turns: Vec<_> = (0..4)
            .map(|n| {
                let runtime = Arc::clone(&runtime);
                tokio::spawn(async move {
                    runtime
                        .process_message(&id(), &format!("question {n}"))
                        .await
                        .unwrap()
                })
            })
            .collect();
        for turn in turns {
            turn.await.unwrap();
        }

        let history = runtime.history().snapshot(&id()).await;
        assert_eq!(history.len(), 8);
        for pair in history.chunks(2) {
            assert_eq!(pair[0].role, ChatRole::User);
            assert_eq!(pair[1].role, ChatRole::Assistant);
        }
    }
}
