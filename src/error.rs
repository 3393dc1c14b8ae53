use thiserror::Error;

/// Failures surfaced by the runtime.
///
/// Every public operation returns one of these kinds as a value; no
/// failure crosses a subsystem boundary as a panic, and the boundary
/// service converts anything left over into a JSON error envelope.
#[derive(Debug, Error)]
pub enum Error {
    /// Subsystem used before `initialize`.
    #[error("not initialized: {0}")]
    NotInitialized(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Blob MAC failure or an undecodable persisted record.
    #[error("corruption: {0}")]
    Corruption(String),

    /// The invocation exceeded its gas ceiling. `used` is saturated at
    /// the limit so the caller never observes `used > limit`.
    #[error("gas limit exceeded: {used} of {limit}")]
    GasExceeded { used: u64, limit: u64 },

    /// Sealing, attestation or RNG failure; fatal for the calling op.
    #[error("platform error: {0}")]
    Platform(String),

    /// The caller's fixed-size buffer cannot hold the response; retry
    /// with at least `needed` bytes.
    #[error("buffer too small: {needed} bytes required")]
    BufferTooSmall { needed: usize },

    #[error("{0}")]
    Unknown(String),
}

impl Error {
    /// Stable kind tag used in boundary error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotInitialized(_) => "NotInitialized",
            Error::InvalidArgument(_) => "InvalidArgument",
            Error::NotFound(_) => "NotFound",
            Error::AlreadyExists(_) => "AlreadyExists",
            Error::Corruption(_) => "Corruption",
            Error::GasExceeded { .. } => "GasExceeded",
            Error::Platform(_) => "PlatformError",
            Error::BufferTooSmall { .. } => "BufferTooSmall",
            Error::Unknown(_) => "Unknown",
        }
    }

    /// JSON error envelope returned across the boundary.
    pub fn envelope(&self) -> String {
        serde_json::json!({ "error": format!("{}: {}", self.kind(), self) }).to_string()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_carries_kind_and_detail() {
        let err = Error::InvalidArgument("empty key".to_string());
        let envelope: serde_json::Value = serde_json::from_str(&err.envelope()).unwrap();
        assert_eq!(
            envelope["error"].as_str().unwrap(),
            "InvalidArgument: invalid argument: empty key"
        );
    }

    #[test]
    fn test_gas_exceeded_reports_saturated_usage() {
        let err = Error::GasExceeded { used: 5000, limit: 5000 };
        assert_eq!(err.kind(), "GasExceeded");
        assert!(err.to_string().contains("5000 of 5000"));
    }
}
