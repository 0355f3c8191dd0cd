//! Error types for provider interactions.

use std::fmt;

/// Errors that can occur when talking to an LLM provider.
#[derive(Debug)]
pub enum LLMError {
    /// HTTP request/response errors
    HttpError(String),
    /// Authentication and authorization errors
    AuthError(String),
    /// Invalid request parameters or format
    InvalidRequest(String),
    /// Errors returned by the LLM provider
    ProviderError(String),
    /// API response parsing or format error
    ResponseFormatError {
        message: String,
        raw_response: String,
    },
    /// JSON serialization/deserialization errors
    JsonError(String),
    /// Functionality not implemented by this provider
    NotImplemented(String),
}

impl fmt::Display for LLMError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LLMError::HttpError(e) => write!(f, "HTTP Error: {}", e),
            LLMError::AuthError(e) => write!(f, "Auth Error: {}", e),
            LLMError::InvalidRequest(e) => write!(f, "Invalid Request: {}", e),
            LLMError::ProviderError(e) => write!(f, "Provider Error: {}", e),
            LLMError::ResponseFormatError {
                message,
                raw_response,
            } => {
                write!(
                    f,
                    "Response Format Error: {}. Raw response: {}",
                    message, raw_response
                )
            }
            LLMError::JsonError(e) => write!(f, "JSON Parse Error: {}", e),
            LLMError::NotImplemented(e) => write!(f, "Not Implemented: {}", e),
        }
    }
}

impl std::error::Error for LLMError {}

impl From<serde_json::Error> for LLMError {
    fn from(err: serde_json::Error) -> Self {
        LLMError::JsonError(err.to_string())
    }
}

impl From<reqwest::Error> for LLMError {
    fn from(err: reqwest::Error) -> Self {
        LLMError::HttpError(err.to_string())
    }
}

impl LLMError {
    /// HTTP status code carried by the error, when it came from a response.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            LLMError::HttpError(msg) | LLMError::ProviderError(msg) => msg
                .split_whitespace()
                .find_map(|tok| tok.parse::<u16>().ok())
                .filter(|code| (100..600).contains(code)),
            _ => None,
        }
    }

    /// Whether this error represents a client-side (4xx) rejection.
    pub fn is_client_error(&self) -> bool {
        matches!(self, LLMError::InvalidRequest(_) | LLMError::AuthError(_))
            || self
                .status_code()
                .map(|code| (400..500).contains(&code))
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_human_readable() {
        assert_eq!(
            LLMError::ProviderError("overloaded".into()).to_string(),
            "Provider Error: overloaded"
        );
        assert_eq!(
            LLMError::InvalidRequest("bad tool schema".into()).to_string(),
            "Invalid Request: bad tool schema"
        );
    }

    #[test]
    fn status_code_extracted_from_http_error() {
        let err = LLMError::HttpError("status 429 from provider".into());
        assert_eq!(err.status_code(), Some(429));
        assert!(err.is_client_error());
    }

    #[test]
    fn invalid_request_is_client_error() {
        assert!(LLMError::InvalidRequest("nope".into()).is_client_error());
        assert!(!LLMError::ProviderError("boom".into()).is_client_error());
    }
}
