//! Error types for atlink.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for atlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Which half of a firmware update never completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    /// The success marker was never reported.
    NoSuccess,
    /// Success was reported but the module never signalled it was ready.
    NotReady,
}

impl std::fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSuccess => write!(f, "no update success reported"),
            Self::NotReady => write!(f, "update succeeded but module never became ready"),
        }
    }
}

/// Error type for atlink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (sink/source files, port I/O not covered below).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error reported by the native driver.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The serial device could not be opened.
    #[error("Port {port} unavailable: {reason}")]
    PortUnavailable {
        /// Device name as given by the caller.
        port: String,
        /// Driver message.
        reason: String,
    },

    /// The device was opened but refused the line settings.
    #[error("Port configuration rejected: {0}")]
    ConfigurationRejected(String),

    /// A write was not accepted by the device within its timeout.
    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// The device accepted fewer bytes than requested.
    #[error("Short write: {written} of {expected} bytes accepted")]
    WriteShort {
        /// Bytes accepted.
        written: usize,
        /// Bytes requested.
        expected: usize,
    },

    /// The driver output queue did not empty in time.
    #[error("Output queue not drained after {timeout:?} ({pending} bytes pending)")]
    DrainTimeout {
        /// Drain budget.
        timeout: Duration,
        /// Bytes still queued when the budget ran out.
        pending: u32,
    },

    /// No data arrived yet. Soft: callers retry.
    #[error("Read timed out")]
    ReadTimeout,

    /// The expected response never arrived within budget.
    #[error("Timed out after {timeout:?} waiting for {pattern:?}")]
    PatternTimeout {
        /// What was being waited for.
        pattern: String,
        /// Wait budget.
        timeout: Duration,
    },

    /// Line/binary alignment of the stream can no longer be trusted.
    #[error("Protocol desync: {0}")]
    ProtocolDesync(String),

    /// A single chunk request failed. Retried while budget remains.
    #[error("Chunk at offset {offset} failed: {line}")]
    ChunkError {
        /// Offset the chunk was requested at.
        offset: u64,
        /// Control line that reported the failure.
        line: String,
    },

    /// A chunk kept failing at the same offset.
    #[error("Retry budget exhausted at offset {offset} after {attempts} attempts")]
    RetryBudgetExhausted {
        /// Offset that could not be fetched.
        offset: u64,
        /// Total attempts made at that offset.
        attempts: u32,
    },

    /// The firmware update did not finish within the overall ceiling.
    #[error("Firmware update timed out after {timeout:?}: {phase} (last progress {last_progress})")]
    UpdateTimeout {
        /// Which marker was missing.
        phase: UpdatePhase,
        /// Overall ceiling.
        timeout: Duration,
        /// Last progress value seen, -1 if none.
        last_progress: i32,
    },

    /// The modem answered a command with an error line.
    #[error("Command {command:?} failed: {line}")]
    CommandFailed {
        /// Command as sent.
        command: String,
        /// Error line received.
        line: String,
    },

    /// Upload source length differs from the declared size.
    #[error("Source has {actual} bytes, expected {expected}")]
    SourceMismatch {
        /// Declared size.
        expected: u64,
        /// Bytes actually read.
        actual: u64,
    },

    /// The session was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Malformed session script or missing variable.
    #[error("Script error: {0}")]
    Script(String),
}

impl Error {
    /// Whether the error only means "try again" rather than a failed step.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ReadTimeout | Self::ChunkError { .. })
    }

    pub(crate) fn desync(msg: impl Into<String>) -> Self {
        Self::ProtocolDesync(msg.into())
    }

    pub(crate) fn script(msg: impl Into<String>) -> Self {
        Self::Script(msg.into())
    }
}
