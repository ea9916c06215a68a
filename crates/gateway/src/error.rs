use reqwest::StatusCode;
use reqwest::header::InvalidHeaderValue;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Failed to create header value: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("URL parsing failed: {0}")]
    Url(#[from] url::ParseError),
    #[error("{action} failed with status: {status}, body: {body}")]
    RequestFailed {
        action: String,
        status: StatusCode,
        body: String,
    },
    #[error("{action} still failing with status {status} after {attempts} attempts")]
    RetriesExhausted {
        action: String,
        status: StatusCode,
        attempts: usize,
    },
    #[error(
        "Failed to parse API response: {action}, response: {response_text}, error: {parse_error}"
    )]
    ApiResponseParse {
        action: String,
        response_text: String,
        parse_error: String,
    },
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl GatewayError {
    /// Whether a later attempt at the same call could reasonably succeed.
    /// Terminal 4xx answers and malformed payloads are not worth repeating.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::RetriesExhausted { .. } => true,
            Self::RequestFailed { status, .. } => status.is_server_error(),
            Self::InvalidHeader(_)
            | Self::Url(_)
            | Self::ApiResponseParse { .. }
            | Self::InvalidConfiguration(_) => false,
        }
    }
}
