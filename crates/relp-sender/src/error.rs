//! Error types for the sender.

use thiserror::Error;

/// Sender error type.
#[derive(Error, Debug)]
pub enum SenderError {
    /// IO error (socket, file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS setup or handshake error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Socket failure reported asynchronously by the connection
    #[error("Transport error: {0}")]
    Transport(String),

    /// The peer closed the connection
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Write attempted after the sender was ended or closed
    #[error("write after close")]
    WriteAfterClose,

    /// RELP-only operation called without RELP enabled
    #[error("RELP is not enabled: {0}")]
    RelpDisabled(&'static str),

    /// Input chunk could not be decoded
    #[error("Encoding error: {0}")]
    Encoding(String),
}

/// Result type for sender operations.
pub type SenderResult<T> = Result<T, SenderError>;
