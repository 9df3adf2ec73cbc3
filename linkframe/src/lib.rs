//! Wire framing and reliability primitives for the linkhub device protocol.
//!
//! This crate holds the parts of the protocol that have no business knowing
//! about sockets, tasks, or wall-clock time: the frame preheader shape, its
//! hex-ASCII wire encoding, the sending sequence counter with its
//! `0`-is-reserved wraparound, and the 256-bit dedup bitmap. Everything that
//! needs an event loop (ACK waits, keepalives, client objects) lives in the
//! `server` crate, built on top of these types.

#![cfg_attr(not(feature = "std"), no_std)]

pub mod config;
pub mod dedup;
pub mod error;
pub mod frame;
pub mod seq;

pub use config::LoginMarker;
pub use dedup::DedupWindow;
pub use error::{Error, FrameDecodeError, Result};
pub use frame::{Frame, FrameFlags, Line, ACK_FLAGS, MAX_APP_HEADER_LEN, MAX_PAYLOAD_LEN, PREHEADER_LEN};
pub use seq::SeqCounter;
