use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("No API key configured for provider {provider}")]
    MissingApiKey { provider: String },

    #[error("Network error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Status { status: u16, message: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Request timed out after {seconds}s")]
    Timeout { seconds: u64 },
}
