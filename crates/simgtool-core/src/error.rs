//! Error types for the simgtool core library.

use std::path::PathBuf;

/// Closed set of failure kinds every core operation reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed header or chunk, misaligned length, inconsistent request.
    InvalidArgument,
    /// A working buffer could not be allocated.
    OutOfMemory,
    /// Length/offset arithmetic overflowed or input ended early.
    Overflow,
    /// The requested feature is not implemented.
    NotSupported,
    /// The operation needs to seek but the stream cannot.
    NotSeekable,
    /// The backing device or file does not exist.
    NoDevice,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::InvalidArgument => write!(f, "invalid argument"),
            ErrorKind::OutOfMemory => write!(f, "out of memory"),
            ErrorKind::Overflow => write!(f, "overflow"),
            ErrorKind::NotSupported => write!(f, "not supported"),
            ErrorKind::NotSeekable => write!(f, "not seekable"),
            ErrorKind::NoDevice => write!(f, "no such device"),
        }
    }
}

/// The main error type for simgtool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// Malformed input or an argument the operation cannot accept.
    #[error("Invalid sparse file format: {message}")]
    InvalidArgument { message: String },

    /// The embedded CRC32 does not match the one computed while reading.
    #[error("CRC32 mismatch: expected {expected:08x}, computed {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// The input ended before a complete value could be read.
    #[error("EOF while reading {context}")]
    UnexpectedEof { context: String },

    /// Arithmetic over- or underflow on lengths, offsets or block numbers.
    #[error("Overflow: {message}")]
    Overflow { message: String },

    /// Failed allocation of a working buffer.
    #[error("Failed allocation of {size} bytes")]
    OutOfMemory { size: usize },

    /// Feature that exists in the interface but is not implemented.
    #[error("Not supported: {message}")]
    NotSupported { message: String },

    /// A seek was required on a stream that cannot seek.
    #[error("Stream is not seekable: {message}")]
    NotSeekable { message: String },
}

/// A specialized Result type for simgtool operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create an invalid-argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create an unexpected end-of-input error.
    pub fn unexpected_eof(context: impl Into<String>) -> Self {
        Self::UnexpectedEof {
            context: context.into(),
        }
    }

    /// Create an overflow error.
    pub fn overflow(message: impl Into<String>) -> Self {
        Self::Overflow {
            message: message.into(),
        }
    }

    /// Create an out-of-memory error.
    pub fn out_of_memory(size: usize) -> Self {
        Self::OutOfMemory { size }
    }

    /// Create a not-supported error.
    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported {
            message: message.into(),
        }
    }

    /// Create a not-seekable error.
    pub fn not_seekable(message: impl Into<String>) -> Self {
        Self::NotSeekable {
            message: message.into(),
        }
    }

    /// Classify this error into the closed failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io { source, .. } => match source.kind() {
                std::io::ErrorKind::UnexpectedEof => ErrorKind::Overflow,
                std::io::ErrorKind::OutOfMemory => ErrorKind::OutOfMemory,
                std::io::ErrorKind::Unsupported => ErrorKind::NotSupported,
                std::io::ErrorKind::NotFound => ErrorKind::NoDevice,
                _ => ErrorKind::InvalidArgument,
            },
            Error::InvalidArgument { .. } | Error::ChecksumMismatch { .. } => {
                ErrorKind::InvalidArgument
            }
            Error::UnexpectedEof { .. } | Error::Overflow { .. } => ErrorKind::Overflow,
            Error::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Error::NotSupported { .. } => ErrorKind::NotSupported,
            Error::NotSeekable { .. } => ErrorKind::NotSeekable,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::io(io_err, "/path/to/system.img");
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
        assert!(msg.contains("/path/to/system.img"));
        assert_eq!(err.kind(), ErrorKind::NoDevice);
    }

    #[test]
    fn test_io_error_without_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = Error::io_simple(io_err);
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
        assert!(!msg.contains("at '"));
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_io_eof_maps_to_overflow() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short");
        assert_eq!(Error::from(io_err).kind(), ErrorKind::Overflow);
    }

    #[test]
    fn test_checksum_mismatch() {
        let err = Error::ChecksumMismatch {
            expected: 0xdeadbeef,
            actual: 0x12345678,
        };
        let msg = err.to_string();
        assert!(msg.contains("deadbeef"));
        assert!(msg.contains("12345678"));
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_kinds() {
        assert_eq!(Error::invalid_argument("x").kind(), ErrorKind::InvalidArgument);
        assert_eq!(Error::unexpected_eof("header").kind(), ErrorKind::Overflow);
        assert_eq!(Error::overflow("x").kind(), ErrorKind::Overflow);
        assert_eq!(Error::out_of_memory(16).kind(), ErrorKind::OutOfMemory);
        assert_eq!(Error::not_supported("x").kind(), ErrorKind::NotSupported);
        assert_eq!(Error::not_seekable("x").kind(), ErrorKind::NotSeekable);
    }

    #[test]
    fn test_eof_message() {
        let err = Error::unexpected_eof("chunk header");
        assert_eq!(err.to_string(), "EOF while reading chunk header");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io { path: None, .. }));
    }
}
