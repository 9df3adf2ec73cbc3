//! Error types for the linkframe wire protocol.

use core::fmt;

/// Result type alias for linkframe operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Reasons a single line failed to decode into a frame.
///
/// These are always local to one line: the caller drops the line and keeps
/// reading the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecodeError {
    /// Line is shorter than the 10 hex characters the preheader needs.
    ShortPreheader,
    /// A hex digit outside `[0-9a-f]` appeared where one was expected.
    BadHex,
    /// `payload_len` in the preheader didn't match the bytes actually on the line.
    PayloadLengthMismatch,
    /// The payload bytes were not valid UTF-8.
    NonUtf8Payload,
    /// The payload decoded as UTF-8 but not as JSON.
    MalformedJson,
}

impl FrameDecodeError {
    /// Human-readable description.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ShortPreheader => "line shorter than preheader",
            Self::BadHex => "invalid hex digit",
            Self::PayloadLengthMismatch => "payload length mismatch",
            Self::NonUtf8Payload => "payload is not valid utf-8",
            Self::MalformedJson => "payload is not valid json",
        }
    }
}

impl fmt::Display for FrameDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the framing/sequencing primitives in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A line failed to decode; see the nested reason.
    FrameDecode(FrameDecodeError),
    /// Caller-supplied buffer is too small to hold the encoded frame.
    BufferTooSmall,
    /// App header exceeds 255 bytes or payload exceeds 65535 bytes.
    PayloadTooLarge,
}

impl From<FrameDecodeError> for Error {
    fn from(e: FrameDecodeError) -> Self {
        Error::FrameDecode(e)
    }
}

impl Error {
    /// Human-readable description.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Error::FrameDecode(e) => e.as_str(),
            Error::BufferTooSmall => "buffer too small",
            Error::PayloadTooLarge => "payload too large",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

#[cfg(feature = "std")]
impl std::error::Error for FrameDecodeError {}
