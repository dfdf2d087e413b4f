use thiserror::Error;

/// Failures surfaced by library entry points.
///
/// State machines absorb transient faults internally; what reaches the caller
/// is input validation, resource exhaustion and contract violations. No entry
/// point panics.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("idTag exceeds 20 characters: {0}")]
    IdTagTooLong(String),

    #[error("Connector {0} is out of bounds")]
    ConnectorOutOfBounds(u32),

    #[error("Connector {0} already runs a transaction")]
    TransactionAlreadyActive(u32),

    #[error("Transaction store rejected the record")]
    StoreRejected,

    #[error("Firmware update already in progress (stage {0})")]
    FirmwareUpdateInProgress(&'static str),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for library operations.
pub type CoreResult<T> = Result<T, CoreError>;
