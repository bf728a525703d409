#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    #[error("inference error: {0}")]
    Inference(#[from] InferenceError),
    #[error("context error: {0}")]
    Context(#[from] ContextError),
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum InferenceError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("API returned {status}: {body}")]
    ApiError { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
    #[error("stream interrupted: {0}")]
    Stream(String),
}

impl InferenceError {
    /// Worth another attempt: server-side failures and broken connections.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(_) | Self::Stream(_) => true,
            Self::ApiError { status, .. } => *status >= 500,
            Self::Parse(_) => false,
        }
    }

    /// Short classification shown to chat users. Never includes the raw payload.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::ApiError { status: 400, .. } => {
                "Request error. Please check the format of the messages sent."
            }
            Self::ApiError { status: 401 | 403, .. } => {
                "The model backend rejected our credentials."
            }
            Self::ApiError { status: 404, .. } => "The requested model does not exist.",
            Self::ApiError { status: 429, .. } => {
                "Rate limited by the model backend. Please wait a moment."
            }
            Self::ApiError { status, .. } if *status >= 500 => {
                "The model backend had an internal error. Please try again later."
            }
            Self::Request(_) | Self::Stream(_) => {
                "Could not reach the model backend. Please try again later."
            }
            Self::Parse(_) => "The model backend sent a response we could not read.",
            Self::ApiError { .. } => "The model backend refused the request.",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("token counting failed: {0}")]
    TokenCount(#[source] InferenceError),
    #[error("token budget must be greater than zero")]
    InvalidBudget,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Why one attachment of an inbound message was skipped.
#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    #[error("{filename}: file exceeds the {limit_mb}MB limit")]
    TooLarge { filename: String, limit_mb: u64 },
    #[error("{filename}: unsupported file type {content_type}")]
    Unsupported {
        filename: String,
        content_type: String,
    },
    #[error("{filename}: file must be UTF-8 encoded")]
    Undecodable { filename: String },
    #[error("{filename}: could not read attachment: {reason}")]
    Read { filename: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command `{0}`")]
    Unknown(String),
    #[error("`{command}` needs an argument: {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
    #[error("`{0}` is not a valid positive integer")]
    InvalidNumber(String),
    #[error("aspect ratio `{0}` must look like `width:height`, for example `16:9`")]
    InvalidAspectRatio(String),
    #[error("unterminated quote")]
    UnterminatedQuote,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient() {
        let err = InferenceError::ApiError {
            status: 503,
            body: "overloaded".into(),
        };
        assert!(err.is_transient());
        assert!(!err.user_message().contains("overloaded"));
    }

    #[test]
    fn bad_requests_are_permanent() {
        let err = InferenceError::ApiError {
            status: 400,
            body: "{\"error\": \"bad\"}".into(),
        };
        assert!(!err.is_transient());
        assert!(err.user_message().starts_with("Request error"));
        assert!(!InferenceError::Parse("eof".into()).is_transient());
    }

    #[test]
    fn network_failures_are_transient() {
        assert!(InferenceError::Request("connection reset".into()).is_transient());
    }
}
