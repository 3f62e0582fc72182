use thiserror::Error;

pub mod auth;
pub mod feeds;
pub mod kalshi;
pub mod polymarket;
pub mod websocket;

pub use kalshi::KalshiClient;
pub use polymarket::PolymarketClient;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {status}: {body}")]
    HttpStatus {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("request signing error: {0}")]
    Signing(String),

    #[error("venue rejected order: {0}")]
    OrderRejected(String),

    #[error("deadline exceeded: {0}")]
    Deadline(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Transient failures are retried inside the adapters and survivable by
    /// callers; everything else indicates a bug or bad credentials and is
    /// surfaced as fatal.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Http(_) | ClientError::Deadline(_) => true,
            ClientError::HttpStatus { status, .. } => status.is_server_error(),
            ClientError::WebSocket(_) => true,
            ClientError::OrderRejected(_) => true,
            ClientError::SerdeJson(_) | ClientError::Signing(_) | ClientError::Config(_) => false,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
