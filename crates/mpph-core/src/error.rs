//! Error types shared by the pipeline crates.
//!
//! Three failure classes exist: decode errors (the export stream is broken,
//! fatal), sink errors (the destination refused a record, fatal to the rest
//! of the batch) and everything else. Records dropped for missing required
//! fields are not errors and never show up here.

/// Configuration loading and validation errors
#[derive(Debug, thiserror::Error)]
pub enum MpphError {
    /// Missing or inconsistent configuration
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    ConfigSource(#[from] config::ConfigError),
}

/// A malformed or truncated unit in the export stream.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed export unit #{unit} at byte {offset}: {source}")]
    Malformed {
        /// 1-based index of the unit that failed to decode
        unit: usize,
        /// Stream offset where the unit starts
        offset: u64,
        #[source]
        source: serde_json::Error,
    },

    #[error("export stream ended inside unit #{unit} ({pending} bytes pending)")]
    Truncated { unit: usize, pending: usize },

    #[error("reading export stream: {0}")]
    Io(#[from] std::io::Error),
}

/// The destination failed to accept a record.
///
/// `lost` counts messages the client had already accepted (buffered) that
/// went down with the failed request.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("ingestion request failed ({lost} accepted messages lost): {message}")]
    Transport { message: String, lost: usize },

    #[error("ingestion endpoint rejected batch with status {status} ({lost} accepted messages lost): {body}")]
    Rejected {
        status: u16,
        body: String,
        lost: usize,
    },

    #[error("serializing ingestion payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("writing ingestion output: {0}")]
    Io(#[from] std::io::Error),

    #[error("ingestion client is closed")]
    Closed,
}

impl SinkError {
    /// Previously accepted messages dropped along with this failure
    pub fn lost(&self) -> usize {
        match self {
            SinkError::Transport { lost, .. } | SinkError::Rejected { lost, .. } => *lost,
            _ => 0,
        }
    }
}

/// A batch delivery aborted on its first sink failure.
#[derive(Debug, thiserror::Error)]
#[error("delivery aborted after {delivered} records: {source}")]
pub struct DeliveryError {
    /// Records accepted by the sink before the failure
    pub delivered: usize,
    #[source]
    pub source: SinkError,
}
