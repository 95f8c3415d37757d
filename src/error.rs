//! Error types for device link operations

use thiserror::Error;

use crate::frame::FramingError;
use crate::proto::command::Command;
use crate::proto::status;

/// Result type alias for link operations
pub type Result<T> = std::result::Result<T, LinkError>;

#[derive(Debug, Error)]
pub enum LinkError {
    /// Malformed header, length disagreement or bad sentinel
    #[error("framing: {0}")]
    Framing(#[from] FramingError),

    /// Transient device condition; retryable within the configured budget
    #[error("device busy on {command}: {reason}")]
    DeviceBusy { command: Command, reason: String },

    /// Hard failure status reported by the device
    #[error("device rejected {command}: status {status} ({reason})")]
    DeviceRejected {
        command: Command,
        status: u32,
        reason: &'static str,
    },

    /// Read/write failure on the underlying bus
    #[error("transport: {source}")]
    Transport {
        #[from]
        source: std::io::Error,
    },

    /// Reply did not correlate with the request that was sent
    #[error("unexpected reply to {sent}: command code {got:#06x}")]
    UnexpectedResponse { sent: Command, got: u16 },

    /// Raw result has fewer bytes than its descriptors require
    #[error("truncated result: {what} needs {needed} bytes at offset {offset}, buffer has {available}")]
    TruncatedResult {
        what: String,
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// Raw result declares an impossible node count
    #[error("result declares {count} output nodes, at most {max} supported")]
    NodeOverflow { count: i64, max: usize },

    /// Node footprints do not account for the whole raw result
    #[error("result length mismatch: nodes account for {accounted} bytes, buffer has {actual}")]
    ResultLengthMismatch { accounted: usize, actual: usize },

    /// Device announced a result larger than the caller's capacity
    #[error("result of {len} bytes exceeds capacity of {capacity}")]
    ResultTooLarge { len: usize, capacity: usize },

    /// Window accounting, slot ownership or reply contents desynchronised
    #[error("protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    #[error("timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("cancelled")]
    Cancelled,
}

impl LinkError {
    pub fn busy(command: Command, reason: impl Into<String>) -> Self {
        Self::DeviceBusy {
            command,
            reason: reason.into(),
        }
    }

    pub fn rejected(command: Command, status: u32) -> Self {
        Self::DeviceRejected {
            command,
            status,
            reason: status::describe(status),
        }
    }

    pub fn violation(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            reason: reason.into(),
        }
    }

    pub fn truncated(what: impl Into<String>, offset: usize, needed: usize, available: usize) -> Self {
        Self::TruncatedResult {
            what: what.into(),
            offset,
            needed,
            available,
        }
    }

    /// Whether resending the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DeviceBusy { .. })
    }

    /// Errors that spoil one result but leave the stream usable.
    pub fn is_result_local(&self) -> bool {
        matches!(
            self,
            Self::TruncatedResult { .. } | Self::NodeOverflow { .. } | Self::ResultLengthMismatch { .. }
        )
    }
}
