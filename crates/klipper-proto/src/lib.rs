#![deny(clippy::all)]
#![cfg_attr(not(feature = "std"), no_std)]

//! # Klipper MCU Protocol
//!
//! The wire codec for the host `<-> MCU binary protocol: frame
//! parsing/building, VLQ parameter encoding, and the connect-time data
//! dictionary that maps message names to ids and parameter shapes.
//!
//! ## Key components
//!
//! - **[`frame`]**: length-prefixed, sequence-numbered, CRC-16 framing.
//! - **[`vlq`]**: base-128 variable-length integers, zig-zag for signed.
//! - **[`dictionary`]**: the compressed-JSON message catalog (`std` only).
//! - **[`commands`]**: typed helpers for the hot-path `queue_step` command.

#[cfg(feature = "alloc")]
extern crate alloc;

pub mod commands;
pub mod crc;
#[cfg(feature = "std")]
pub mod dictionary;
pub mod frame;
pub mod vlq;

/// Common error type for the protocol crate.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    /// A frame was received that was not long enough to be valid yet.
    IncompleteFrame,
    /// An invalid frame length or sync byte was found where a header was expected.
    InvalidSync,
    /// The CRC-16 checksum of a received frame was invalid.
    InvalidCrc,
    /// The message payload could not be decoded into a known shape.
    InvalidPayload,
    /// A buffer was too small for the requested operation.
    BufferTooSmall,
    /// An encode would exceed `MESSAGE_MAX`/a message's `max_size`.
    MessageTooLarge,
    /// A received message id has no entry in the data dictionary.
    UnknownMessage,
}

#[cfg(feature = "std")]
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Error::IncompleteFrame => "incomplete frame",
            Error::InvalidSync => "invalid sync/length",
            Error::InvalidCrc => "invalid crc",
            Error::InvalidPayload => "invalid payload",
            Error::BufferTooSmall => "buffer too small",
            Error::MessageTooLarge => "message too large",
            Error::UnknownMessage => "unknown message id",
        };
        f.write_str(s)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
