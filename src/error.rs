use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Unified error type for relay-core operations.
///
/// Variants mirror the error-kind table of the design: each kind names
/// where it is produced and how the owning component degrades.
/// - `WireIo`/`Timeout`/`Unauthorized`: connection and subscription layer (C1/C2)
/// - `Decode`/`Validation`: event and frame parsing, any component
/// - `NotFound`: fetch-by-id paths (C6/C8)
/// - `StorageIo`: persistence layer (C3/C4/C7/C8 snapshot writers)
/// - `Protocol`: publisher/signer boundary (C9)
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("wire io error on {relay}: {source}")]
    WireIo {
        relay: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("malformed frame: {0}")]
    Decode(String),

    #[error("invalid event: {0}")]
    Validation(String),

    #[error("subscription {0} timed out")]
    Timeout(String),

    #[error("not found")]
    NotFound,

    #[error("relay {0} requires authentication")]
    Unauthorized(String),

    #[error("storage io error: {0}")]
    StorageIo(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub fn wire_io(relay: impl Into<String>, source: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WireIo { relay: relay.into(), source }
    }
}
