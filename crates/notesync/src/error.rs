use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Establishment or transport failure. Drives the reconnection policy on
    /// the channel and ends an ingestion when the response stream breaks.
    #[error("connection error: {0}")]
    Connection(String),
    #[error("protocol decode error: {0}")]
    ProtocolDecode(String),
    /// The streaming endpoint sent an explicit `error` frame.
    #[error("stream terminated by server: {0}")]
    StreamTermination(String),
    #[error("reconnection abandoned after {attempts} attempts")]
    ExhaustedRetries { attempts: u32 },
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;
