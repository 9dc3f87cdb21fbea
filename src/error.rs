//! Error types for jitlink.

use thiserror::Error;

/// Main error type for all jitlink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while parsing an engine configuration document.
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),

    /// Protocol violation (bad magic, truncated response, bad checksum).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transport closed while a read or write was in progress.
    #[error("connection closed")]
    ConnectionClosed,

    /// Engine startup failure; the protocol loop never starts.
    #[error("startup failed: {0}")]
    Startup(String),

    /// A second engine instance was started while one is active.
    #[error("engine already running on this device")]
    EngineActive,

    /// The device answered with an error response.
    #[error("device returned error {code:#x} for command {cmd_id:#04x}")]
    Device { cmd_id: u8, code: u32 },
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
