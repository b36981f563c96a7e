use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("timeout after {0:?} while receiving data")]
    Timeout(std::time::Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("unknown measurand: {0}")]
    UnknownMeasurand(String),
    #[error("data doesn't match with header")]
    HeaderMismatch,
    #[error("header already exists")]
    HeaderAlreadyExists,
    #[error("MQTT error: {0}")]
    Mqtt(String),
    #[error("InfluxDB error: {0}")]
    Influx(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// A timeout aborts the current read outright; it is never retried.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AppError::Timeout(_))
    }
}
