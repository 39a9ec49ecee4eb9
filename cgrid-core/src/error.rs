//! Shared error model for the cgrid crates.

use thiserror::Error;

/// Result alias used by all public interfaces in the cgrid crates.
pub type CgridResult<T> = Result<T, CgridError>;

/// Errors surfaced across crate boundaries.
///
/// Reservation-protocol rejections (capacity, worker votes) are not errors at
/// this level; they are modelled as vote outcomes in `cgrid-operator`.
#[derive(Debug, Error)]
pub enum CgridError {
    /// Mandatory configuration is missing or out of range. Fatal at boot.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A payload failed validation before reaching the protocol layer.
    #[error("malformed payload: {0}")]
    BadInput(String),

    /// The MQTT broker rejected an operation or is unreachable.
    #[error("mqtt transport error: {0}")]
    Mqtt(String),

    /// The service registry could not be reached or gave a bad answer.
    #[error("registry error: {0}")]
    Registry(String),

    /// A remote 2PC participant could not be reached.
    #[error("remote participant unavailable: {0}")]
    RemoteUnavailable(String),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Filesystem or socket I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
