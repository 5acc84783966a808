/// Errors shared across the relaybot crates.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    /// The provider rejected our credentials (HTTP 401/403). Never retried.
    #[error("provider authentication failed: {0}")]
    ProviderAuth(String),

    /// Transport failure, rate limit or non-success status from a provider.
    #[error("provider error: {0}")]
    Provider(String),

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a human should see this error as a failed reply.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::ProviderAuth(_) | Error::Provider(_) | Error::MalformedResponse(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
