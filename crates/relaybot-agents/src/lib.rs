pub mod providers;
pub mod runtime;
pub mod tools;

pub use providers::{
    AnthropicProvider, FinishReason, LlmProvider, LlmRequest, LlmResponse, OpenAiProvider,
    ToolDefinition, Usage,
};
pub use runtime::{AgentRuntime, RuntimeLimits, TurnReply, TurnStatus};
pub use tools::{Tool, ToolErrorKind, ToolRegistry, ToolResult};
