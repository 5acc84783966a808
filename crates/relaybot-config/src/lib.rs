pub mod loader;
pub mod model;

pub use loader::ConfigLoader;
pub use model::{
    AccessConfig, AgentConfig, AppConfig, DEFAULT_SYSTEM_PROMPT, FetchConfig, LlmConfig,
    LogFormat, ProviderKind, SearchConfig, SearchEngine,
};
