//! Bridge errors

use std::time::Duration;

/// Errors raised by the bridge components
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Desktop connection unavailable: {0}")]
    Transport(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Claude tab could not be opened: {0}")]
    Tab(String),

    #[error("Automation failed: {0}")]
    Automation(String),

    #[error("Request payload missing or invalid")]
    MissingPayload,

    #[error("Content bridge unreachable for tab {0}")]
    BridgeUnreachable(u64),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<chromiumoxide::error::CdpError> for BridgeError {
    fn from(e: chromiumoxide::error::CdpError) -> Self {
        BridgeError::Browser(e.to_string())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
