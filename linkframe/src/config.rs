//! Protocol-wide constants shared by the framer, the reliability engine and
//! the client lifecycle manager.

/// Bytes of the fixed 5-byte preheader, hex-encoded on the wire.
pub const PREHEADER_BYTES: usize = 5;

/// Default bounded queue capacity for a client object's rx/tx buffers.
pub const DEFAULT_QUEUE_CAP: usize = 100;

/// Default RX-silence timeout (ms) before a connection is declared dead.
pub const DEFAULT_TIMEOUT_CONNECTION_MS: u64 = 1500;

/// Default idle time (s) a disconnected client object survives before eviction.
pub const DEFAULT_TIMEOUT_OBJECT_S: u64 = 3600;

/// How long (ms) a QOS write waits for its ACK before retrying.
pub const ACK_WAIT_MS: u64 = 1000;

/// Minimum spacing (ms) enforced between two outbound frames on one connection.
pub const INTER_FRAME_GAP_MS: u64 = 50;

/// Grace period (s) an evicted client object sleeps in `closing` before removal,
/// giving app consumers a chance to observe the event.
pub const OBJECT_EVICTION_GRACE_S: u64 = 3;

/// Grace period (s) the registry waits after broadcasting shutdown before
/// closing the listener.
pub const SHUTDOWN_GRACE_S: u64 = 5;

/// The 5-byte preheader that marks a login frame in the header/ACK protocol
/// variant: `seq=0x2c, header_len=0, payload_len=0, flags=0x2c`.
///
/// This collides byte-for-byte with the ACK marker (`flags == 0x2c`) in its
/// last byte; the two are disambiguated by position (a login frame is only
/// ever the first line of a connection).
pub struct LoginMarker;

impl LoginMarker {
    /// The raw 5 bytes a login frame's preheader must decode to.
    pub const BYTES: [u8; PREHEADER_BYTES] = [0x2c, 0x00, 0x00, 0x00, 0x2c];
}
