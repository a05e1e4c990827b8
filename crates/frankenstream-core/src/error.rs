//! Stream engine error taxonomy.
//!
//! Every failure surfaces to the immediate caller as a [`StreamError`]. A failed
//! mode request leaves the stream's prior mode and buffer contents in place.

use std::io;

use thiserror::Error;

use crate::errno;
use crate::stream::Direction;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors produced by the mode engine and its resource managers.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The requested direction is outside the stream's declared capabilities.
    #[error("stream does not support {wanted:?} (supports read={readable}, write={writable})")]
    CapabilityMismatch {
        wanted: Direction,
        readable: bool,
        writable: bool,
    },

    /// Buffer, reserve, pool, or coprocess save growth could not be allocated.
    #[error("out of memory growing {what} to {requested} bytes")]
    ResourceExhausted { what: &'static str, requested: usize },

    /// A seek, flush, or unmap failed during a transition.
    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The stream is frozen by another holder and no discipline resolved it.
    #[error("stream is frozen by another operation")]
    Blocked,

    /// The discipline's exception hook asked to abort with the given code.
    #[error("discipline aborted the request with {0}")]
    Aborted(i32),

    /// A descriptor-backed stream has no descriptor left.
    #[error("stream has no open descriptor")]
    Closed,
}

impl StreamError {
    pub(crate) fn io(op: &'static str, source: io::Error) -> Self {
        Self::Io { op, source }
    }

    pub(crate) fn exhausted(what: &'static str, requested: usize) -> Self {
        Self::ResourceExhausted { what, requested }
    }

    /// The errno value a C caller would observe for this failure.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::CapabilityMismatch { .. } | Self::Closed => errno::EBADF,
            Self::ResourceExhausted { .. } => errno::ENOMEM,
            Self::Io { source, .. } => source.raw_os_error().unwrap_or(errno::EIO),
            Self::Blocked => errno::EAGAIN,
            Self::Aborted(_) => errno::EINTR,
        }
    }

    /// True for failures a discipline may resolve by retrying.
    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        let mismatch = StreamError::CapabilityMismatch {
            wanted: Direction::Write,
            readable: true,
            writable: false,
        };
        assert_eq!(mismatch.errno(), errno::EBADF);
        assert_eq!(StreamError::exhausted("reserve", 8).errno(), errno::ENOMEM);
        assert_eq!(StreamError::Blocked.errno(), errno::EAGAIN);
        let raw = StreamError::io("seek", io::Error::from_raw_os_error(errno::ESPIPE));
        assert_eq!(raw.errno(), errno::ESPIPE);
        let opaque = StreamError::io("flush", io::Error::other("short write"));
        assert_eq!(opaque.errno(), errno::EIO);
    }

    #[test]
    fn display_names_the_operation() {
        let err = StreamError::io("seek", io::Error::other("boom"));
        assert_eq!(err.to_string(), "seek failed: boom");
    }
}
