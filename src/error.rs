use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error taxonomy.
///
/// Transient I/O (Store/Http/Ws) is retried by the caller with backoff.
/// DataShape drops the offending record and continues. Broker rejections are
/// logged with the response body and never retried. Config errors are fatal
/// at startup.
#[derive(Debug, Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("broker rejected request: {status} {body}")]
    Broker { status: u16, body: String },

    #[error("malformed record: {0}")]
    DataShape(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Transient failures are retried with backoff; everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Store(_) | Error::Http(_) | Error::Ws(_))
    }
}
