use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("tool `{0}` not found")]
    ToolNotFound(String),

    #[error("could not resolve tool `{name}` from `{location}`: {reason}")]
    ToolResolutionFailed {
        name: String,
        location: String,
        reason: String,
    },

    #[error("tool `{name}` invocation failed: {source}")]
    ToolInvocation {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("language model error: {0}")]
    LanguageModel(String),

    #[error("mcp error: {0}")]
    Mcp(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl AgentError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn resolution(
        name: impl Into<String>,
        location: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ToolResolutionFailed {
            name: name.into(),
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// Errors a tool produces on its own, as opposed to resolution or transport failures.
    pub fn invocation(
        name: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::ToolInvocation {
            name: name.into(),
            source: source.into(),
        }
    }
}
