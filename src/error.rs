//! Error types for portal operations.

use std::path::PathBuf;

use thiserror::Error;

/// Status returned to a client whose request named a tool the portal does not know.
pub const TOOL_NOT_FOUND_STATUS: i32 = 127;

/// Main error type for portal operations
#[derive(Error, Debug)]
pub enum PortalError {
    /// Invalid configuration in a named section
    #[error("invalid config for '{0}': {1}")]
    InvalidConfig(String, String),

    /// The listening endpoint could not be bound
    #[error("bind failed for endpoint {}: {source}", endpoint.display())]
    Bind {
        endpoint: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Peer closed the stream in the middle of a frame
    #[error("stream closed before a complete frame was read")]
    TruncatedStream,

    /// Frame was complete but its contents were inconsistent
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Frame body does not fit the 32-bit length prefix
    #[error("frame of {0} bytes exceeds the protocol limit")]
    FrameTooLarge(usize),

    /// Request frame carried no tool name
    #[error("request is empty, expected a tool name")]
    EmptyRequest,

    /// Requested tool is not registered
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// Tool invocation aborted before producing a status
    #[error("tool '{tool}' failed: {reason}")]
    ToolFailed { tool: String, reason: String },

    /// Spawned portal never published its endpoint
    #[error("portal did not publish {} after {attempts} attempts", endpoint.display())]
    StartTimeout { endpoint: PathBuf, attempts: u32 },

    /// Connecting to a published endpoint failed
    #[error("connect failed for endpoint {}: {source}", endpoint.display())]
    Connect {
        endpoint: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The portal process could not be launched
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Any other I/O failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PortalError {
    /// Process exit code for this failure.
    ///
    /// Portal failures map to fixed codes so callers can tell "the portal failed"
    /// apart from "the tool failed" (which exits with the tool's own status).
    pub fn exit_code(&self) -> i32 {
        match self {
            PortalError::Bind { .. } => 2,
            PortalError::StartTimeout { .. } => 4,
            PortalError::Connect { .. } => 5,
            PortalError::InvalidConfig(..) => 6,
            PortalError::ToolNotFound(_) => TOOL_NOT_FOUND_STATUS,
            _ => 3,
        }
    }
}

/// Result type alias for portal operations
pub type Result<T> = std::result::Result<T, PortalError>;
