use thiserror::Error;

/// Errors raised while talking to the balance backend or loading configuration.
#[derive(Debug, Error)]
pub enum BalanceError {
    // Transport and API errors
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("API error: {0}")]
    Api(String),

    // Data errors
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("IO error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type BalanceResult<T> = Result<T, BalanceError>;

impl From<reqwest::Error> for BalanceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BalanceError::Parse(err.to_string())
        } else {
            BalanceError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for BalanceError {
    fn from(err: serde_json::Error) -> Self {
        BalanceError::Parse(err.to_string())
    }
}

impl From<std::io::Error> for BalanceError {
    fn from(err: std::io::Error) -> Self {
        BalanceError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for BalanceError {
    fn from(err: toml::de::Error) -> Self {
        BalanceError::Config(err.to_string())
    }
}

impl From<url::ParseError> for BalanceError {
    fn from(err: url::ParseError) -> Self {
        BalanceError::Config(format!("invalid URL: {err}"))
    }
}
