//! Error type shared by the buffer, the writer task and the stream façade.

use std::io::{Error as IoError, ErrorKind};

/// Error type for coalescing stream operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoalesceError {
    /// Sink could not be opened, seeked, written or flushed. Also carries the
    /// terminal failure recorded by the writer task to every later caller.
    ResourceUnavailable(String),
    /// Operation on a stream after `dispose()`
    StreamDisposed,
    /// Admission or take on a buffer after it was disposed
    BufferDisposed,
    /// Cooperative shutdown signal observed by the writer task
    Cancelled,
    /// Sink replacement requested while packets are pending or in flight
    NotIdle,
    /// Operation not supported by the active sink
    Unsupported(&'static str),
    /// Declared packet length exceeds its buffer (or `u32::MAX`)
    InvalidPacket { length: u64, capacity: u64 },
    /// Configuration document failed to parse
    InvalidConfig(String),
}

impl CoalesceError {
    /// True for the errors that mean "this stream or buffer is gone"
    pub fn is_disposed(&self) -> bool {
        matches!(
            self,
            CoalesceError::StreamDisposed | CoalesceError::BufferDisposed
        )
    }
}

impl std::fmt::Display for CoalesceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoalesceError::ResourceUnavailable(msg) => write!(f, "sink unavailable: {}", msg),
            CoalesceError::StreamDisposed => write!(f, "stream has been disposed"),
            CoalesceError::BufferDisposed => write!(f, "packet buffer has been disposed"),
            CoalesceError::Cancelled => write!(f, "operation cancelled"),
            CoalesceError::NotIdle => {
                write!(f, "sink cannot be replaced while writes are pending")
            }
            CoalesceError::Unsupported(what) => write!(f, "unsupported operation: {}", what),
            CoalesceError::InvalidPacket { length, capacity } => write!(
                f,
                "invalid packet: length {} exceeds buffer capacity {}",
                length, capacity
            ),
            CoalesceError::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for CoalesceError {}

impl From<IoError> for CoalesceError {
    fn from(e: IoError) -> Self {
        match e.kind() {
            ErrorKind::NotFound => {
                CoalesceError::ResourceUnavailable(format!("not found: {}", e))
            }
            ErrorKind::PermissionDenied => {
                CoalesceError::ResourceUnavailable(format!("permission denied: {}", e))
            }
            _ => CoalesceError::ResourceUnavailable(e.to_string()),
        }
    }
}
