use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("upstream rejected request: {0}")]
    Upstream(String),

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}

impl From<vn_llm::LlmError> for ServiceError {
    fn from(e: vn_llm::LlmError) -> Self {
        match e {
            vn_llm::LlmError::InvalidInput(msg) => Self::InvalidInput(msg),
            vn_llm::LlmError::Http(msg) => Self::Http(msg),
            vn_llm::LlmError::ResponseFormat(msg) => Self::ResponseFormat(msg),
        }
    }
}
