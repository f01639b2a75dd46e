use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("mesh session has stopped")]
    Stopped,
    #[error("invalid mesh configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid discovery configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("discovery unavailable: {0}")]
    Unavailable(String),
}
