use thiserror::Error;

/// Failures surfaced by processors, the transform engine and cognitive steps.
///
/// Every variant carries owned strings so a single failure can be handed to
/// each awaiting future and each forked stream consumer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SoulError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Processor rate limited: {processor}, retry after {retry_after_ms}ms")]
    RateLimited {
        processor: String,
        retry_after_ms: u64,
    },

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Schema validation failed: {}", errors.join("; "))]
    SchemaValidation { errors: Vec<String> },

    #[error("Malformed output: {0}")]
    MalformedOutput(String),

    #[error("Unknown processor: {label}")]
    UnknownProcessor { label: String },

    #[error("Invalid transformation spec: {0}")]
    InvalidSpec(String),

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<SoulError> },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl SoulError {
    /// Transport flavours and output-shape failures are retried by processors.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SoulError::Transport(_)
                | SoulError::RateLimited { .. }
                | SoulError::Timeout { .. }
                | SoulError::SchemaValidation { .. }
                | SoulError::MalformedOutput(_)
        )
    }

    /// True for caller-driven aborts, including an exhausted wrapper around one.
    pub fn is_cancellation(&self) -> bool {
        match self {
            SoulError::Cancelled => true,
            SoulError::RetriesExhausted { last, .. } => last.is_cancellation(),
            _ => false,
        }
    }

    /// Output did not contain JSON or did not satisfy the schema.
    pub fn is_output_shape(&self) -> bool {
        matches!(
            self,
            SoulError::SchemaValidation { .. } | SoulError::MalformedOutput(_)
        )
    }
}

impl From<serde_json::Error> for SoulError {
    fn from(err: serde_json::Error) -> Self {
        SoulError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for SoulError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return SoulError::Timeout { timeout_ms: 0 };
        }
        SoulError::Transport(err.to_string())
    }
}

impl From<toml::de::Error> for SoulError {
    fn from(err: toml::de::Error) -> Self {
        SoulError::Config(err.to_string())
    }
}

impl From<std::io::Error> for SoulError {
    fn from(err: std::io::Error) -> Self {
        SoulError::Transport(err.to_string())
    }
}

impl From<anyhow::Error> for SoulError {
    fn from(err: anyhow::Error) -> Self {
        SoulError::Other(err.to_string())
    }
}

pub type SoulResult<T> = Result<T, SoulError>;
