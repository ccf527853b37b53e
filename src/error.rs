//! Error handling for the pibridge daemon.

/// A specialized `Result` type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// The main error type for the bridge daemon.
///
/// Only [`BridgeError::Config`] is fatal, and only at startup; every
/// runtime variant is contained at the component that produced it.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Broker connection or protocol failure
    #[error("broker error: {0}")]
    Broker(String),

    /// The sensor did not respond within the read timeout
    #[error("sensor read timed out")]
    SensorTimeout,

    /// The sensor responded but the frame checksum did not match
    #[error("sensor checksum mismatch")]
    ChecksumMismatch,

    /// A GPIO pin write or claim failed at the hardware layer
    #[error("hardware fault: {0}")]
    Hardware(String),

    /// An inbound command targeted a function with no pin assignment
    #[error("unknown pin function: {0}")]
    UnknownFunction(String),

    /// An inbound command payload could not be parsed
    #[error("invalid command payload: {0}")]
    InvalidPayload(String),
}

impl BridgeError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new broker error
    pub fn broker(msg: impl Into<String>) -> Self {
        Self::Broker(msg.into())
    }

    /// Create a new hardware fault
    pub fn hardware(msg: impl Into<String>) -> Self {
        Self::Hardware(msg.into())
    }
}
