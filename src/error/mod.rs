//! Error types for the frame transport

use std::io;
use thiserror::Error;

use crate::core::address::Address;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Transport errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid state error
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Address parse error
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Payload length over the protocol maximum
    #[error("Message too large: {0} bytes (max: {1} bytes)")]
    MessageTooLarge(usize, usize),

    /// No live client is registered under the destination address
    #[error("No client registered for destination {0}")]
    UnknownDestination(Address),

    /// Channel error
    #[error("Channel error: {0}")]
    Channel(String),
}

impl NetworkError {
    /// Create a connection error
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>>(msg: S) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create an invalid address error
    pub fn invalid_address<S: Into<String>>(msg: S) -> Self {
        Self::InvalidAddress(msg.into())
    }

    /// Create a channel error
    pub fn channel<S: Into<String>>(msg: S) -> Self {
        Self::Channel(msg.into())
    }

    /// True when the byte stream can no longer be framed.
    ///
    /// Decoding stops at the offending header and leaves it in the buffer, so
    /// the only way forward is to drop the connection.
    #[must_use]
    pub fn is_stream_corrupt(&self) -> bool {
        matches!(self, Self::MessageTooLarge(..))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = NetworkError::connection("test");
        assert_eq!(err.to_string(), "Connection error: test");

        let err = NetworkError::timeout("operation");
        assert_eq!(err.to_string(), "Operation timed out: operation");

        let err = NetworkError::MessageTooLarge(1000, 512);
        assert_eq!(
            err.to_string(),
            "Message too large: 1000 bytes (max: 512 bytes)"
        );
    }

    #[test]
    fn test_unknown_destination_display() {
        let err = NetworkError::UnknownDestination(Address::new([10, 0, 0, 7], 5000));
        assert_eq!(
            err.to_string(),
            "No client registered for destination 10.0.0.7:5000"
        );
    }

    #[test]
    fn test_stream_corrupt_classification() {
        assert!(NetworkError::MessageTooLarge(1, 0).is_stream_corrupt());
        assert!(!NetworkError::serialization("bad jpeg").is_stream_corrupt());
        assert!(!NetworkError::connection("reset").is_stream_corrupt());
    }
}
