//! Network error types.

use thiserror::Error;

/// Network errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Handshake failed.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Invalid message.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Message too large.
    #[error("Message too large: {size} bytes, max {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// Network magic mismatch.
    #[error("Network magic mismatch")]
    MagicMismatch,

    /// Payload checksum mismatch.
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// Connected to ourselves.
    #[error("Connected to self")]
    SelfConnection,

    /// DNS resolution failed.
    #[error("Failed to resolve {0}")]
    Resolve(String),

    /// Host directory is empty.
    #[error("Address pool empty")]
    AddressPoolEmpty,

    /// Hosts file could not be read or written.
    #[error("Hosts file error: {0}")]
    HostsFile(String),

    /// Every DNS seed path failed.
    #[error("All seed connections failed")]
    SeedsExhausted,

    /// The protocol manager was started twice.
    #[error("Protocol manager already started")]
    AlreadyStarted,

    /// The protocol manager is not running.
    #[error("Protocol manager not running")]
    NotRunning,

    /// Timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
