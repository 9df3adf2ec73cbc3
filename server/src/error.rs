//! Error taxonomy for the client lifecycle manager and app multiplexer.

use std::fmt;

use linkframe::FrameDecodeError;

/// Result type alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the connection layer, client objects and multiplexer.
///
/// `FrameDecodeError` is local to a single line and is logged and dropped by
/// the framer rather than surfaced through this enum in most cases; it is
/// carried here only for callers (such as tests) that want to inspect why a
/// particular line failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A line failed to decode; see the nested reason.
    FrameDecode(FrameDecodeError),
    /// Deadline exceeded awaiting a send slot, a connection, or an ACK.
    WriteTimeout,
    /// Deadline exceeded waiting for a new message to arrive.
    ReadTimeout,
    /// Operation attempted on a client object that has already been evicted.
    ClientRemoved,
    /// Lookup failed and `only_with_connection` forbade creating one.
    NoSuchClient,
    /// The underlying transport write failed; the connection is torn down.
    TransportBroken,
    /// No app factory is registered for the requested `app_ident`.
    AppFactoryError,
    /// App header or payload exceeded the wire format's length limits.
    PayloadTooLarge,
}

impl From<FrameDecodeError> for Error {
    fn from(e: FrameDecodeError) -> Self {
        Error::FrameDecode(e)
    }
}

impl From<linkframe::Error> for Error {
    fn from(e: linkframe::Error) -> Self {
        match e {
            linkframe::Error::FrameDecode(d) => Error::FrameDecode(d),
            linkframe::Error::BufferTooSmall | linkframe::Error::PayloadTooLarge => Error::PayloadTooLarge,
        }
    }
}

impl Error {
    /// Human-readable description.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Error::FrameDecode(e) => e.as_str(),
            Error::WriteTimeout => "timed out waiting for send slot, connection, or ack",
            Error::ReadTimeout => "timed out waiting for a message",
            Error::ClientRemoved => "client object has been removed",
            Error::NoSuchClient => "no such client",
            Error::TransportBroken => "transport write failed",
            Error::AppFactoryError => "no app factory registered for app_ident",
            Error::PayloadTooLarge => "app header or payload exceeds wire format limits",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for Error {}
