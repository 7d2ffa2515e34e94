//! Error types for network planning.

use thiserror::Error;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Planning errors. Everything except `Render` is a configuration error:
/// retrying with the same inputs yields the same failure.
#[derive(Debug, Error, PartialEq)]
pub enum NetworkError {
    #[error("network '{network}' has unsupported type '{kind}'")]
    UnsupportedNetworkType { network: String, kind: String },

    #[error("invalid CIDR range: {0}")]
    InvalidCidr(String),

    #[error("gateway {gateway} is not a host address of {range}")]
    InvalidGateway { range: String, gateway: String },

    #[error("invalid subnet window: {0}")]
    InvalidWindow(String),

    #[error("segment {index} unavailable in {range}: {reason}")]
    SegmentExhausted {
        index: u32,
        range: String,
        reason: String,
    },

    #[error("network '{0}' is not configured")]
    UnknownNetwork(String),

    #[error("manifest rendering failed: {0}")]
    Render(String),
}

impl NetworkError {
    pub fn is_configuration(&self) -> bool {
        !matches!(self, NetworkError::Render(_))
    }
}
