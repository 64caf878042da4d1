use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid {scheme} uri: {reason}")]
    InvalidUri { scheme: String, reason: String },
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("no valid outbounds in batch")]
    EmptyBatch,
    #[error("engine startup failed: {0}")]
    EngineStartup(String),
    #[error("probe failed: {0}")]
    Probe(String),
    #[error("geoip error: {0}")]
    Geo(String),
    #[error("{0}")]
    IOError(#[from] std::io::Error),
    #[error(transparent)]
    SQLError(#[from] sqlx::Error),
    #[error(transparent)]
    HttpError(#[from] reqwest::Error),
    #[error(transparent)]
    ConfigError(#[from] config::ConfigError),
    #[error(transparent)]
    AnyhowError(#[from] anyhow::Error),
}

impl CoreError {
    pub fn invalid_uri(scheme: &str, reason: impl Into<String>) -> Self {
        Self::InvalidUri {
            scheme: scheme.to_string(),
            reason: reason.into(),
        }
    }
}
