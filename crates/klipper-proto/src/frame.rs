//! Wire framing: length-prefixed, sequence-numbered, CRC-terminated frames.
//!
//! ```text
//! byte 0            length (total frame length, MESSAGE_MIN..=MESSAGE_MAX)
//! byte 1            sequence: low nibble = seq % 16, high nibble = 0x10
//! bytes 2..len-3     payload (VLQ-encoded command id + parameters)
//! bytes len-2..len-1 CRC-16/CCITT of bytes[0..len-3], big-endian
//! byte len-1         sync byte, always 0x7e
//! ```

use crate::crc::crc16_ccitt;
use crate::Error;

/// Sync byte terminating every frame.
pub const SYNC_BYTE: u8 = 0x7e;
/// Largest frame Klipper's MCU-side receive buffer will accept.
pub const MESSAGE_MAX: usize = 64;
/// Smallest legal frame: length + seq + crc_hi + crc_lo + sync, empty payload.
pub const MESSAGE_MIN: usize = 5;

const SEQ_MASK: u8 = 0x0f;
const SEQ_HIGH_NIBBLE: u8 = 0x10;

/// Builds a complete frame around `payload`, assigning `seq` into the header.
///
/// `seq` is truncated to its low 4 bits per the wire format; callers pass a
/// free-running `u32`/`u8` counter and let this function mask it.
pub fn build_frame(seq: u8, payload: &[u8]) -> Result<heapless_or_vec::FrameBuf, Error> {
    let len = MESSAGE_MIN + payload.len();
    if len > MESSAGE_MAX {
        return Err(Error::MessageTooLarge);
    }
    let mut frame = heapless_or_vec::FrameBuf::new();
    let _ = frame.push(len as u8);
    let _ = frame.push(SEQ_HIGH_NIBBLE | (seq & SEQ_MASK));
    let _ = frame.extend_from_slice(payload);
    let crc = crc16_ccitt(frame.as_slice(), len - 3);
    let _ = frame.push((crc >> 8) as u8);
    let _ = frame.push((crc & 0xff) as u8);
    let _ = frame.push(SYNC_BYTE);
    Ok(frame)
}

/// An empty-payload frame acking/nacking `seq` (low nibble only is meaningful).
pub fn build_ack(seq: u8) -> heapless_or_vec::FrameBuf {
    build_frame(seq, &[]).expect("empty payload always fits")
}

/// One parsed frame: its sequence number and the byte range of its payload
/// within the input buffer, plus how many input bytes it consumed.
pub struct ParsedFrame {
    pub seq: u8,
    pub payload_start: usize,
    pub payload_end: usize,
    pub consumed: usize,
}

/// Scans `buf` for one complete, CRC-valid frame starting at its front.
///
/// Returns `Ok(None)` if `buf` holds an incomplete frame (caller should wait
/// for more bytes). Returns `Err((err, consumed))` when the leading bytes are
/// not a valid frame start; `consumed` is how many bytes the caller should
/// discard before retrying (resynchronizing on the next plausible header).
pub fn parse(buf: &[u8]) -> Result<Option<ParsedFrame>, (Error, usize)> {
    if buf.is_empty() {
        return Ok(None);
    }
    let len = buf[0] as usize;
    if len < MESSAGE_MIN || len > MESSAGE_MAX {
        return Err((Error::InvalidSync, 1));
    }
    if buf.len() < len {
        return Ok(None);
    }
    if buf[len - 1] != SYNC_BYTE {
        return Err((Error::InvalidSync, 1));
    }
    let crc = crc16_ccitt(buf, len - 3);
    let want = ((buf[len - 3] as u16) << 8) | buf[len - 2] as u16;
    if crc != want {
        return Err((Error::InvalidCrc, 1));
    }
    let seq = buf[1] & SEQ_MASK;
    Ok(Some(ParsedFrame {
        seq,
        payload_start: 2,
        payload_end: len - 3,
        consumed: len,
    }))
}

/// True when the parsed frame carries no payload, i.e. is a bare ack/nack.
pub fn is_ack_frame(frame: &ParsedFrame) -> bool {
    frame.payload_end == frame.payload_start
}

/// Storage backend for [`build_frame`]: `Vec<u8>` under `std`/`alloc`, a fixed
/// `heapless::Vec` otherwise. Kept in its own module so the rest of this file
/// reads the same regardless of which backend is active.
mod heapless_or_vec {
    use super::MESSAGE_MAX;

    #[cfg(feature = "alloc")]
    pub type FrameBuf = Inner;

    #[cfg(feature = "alloc")]
    pub struct Inner(alloc::vec::Vec<u8>);

    #[cfg(feature = "alloc")]
    impl Inner {
        pub fn new() -> Self {
            Inner(alloc::vec::Vec::with_capacity(MESSAGE_MAX))
        }
        pub fn push(&mut self, b: u8) {
            self.0.push(b);
        }
        pub fn extend_from_slice(&mut self, s: &[u8]) {
            self.0.extend_from_slice(s);
        }
        pub fn as_slice(&self) -> &[u8] {
            &self.0
        }
    }

    #[cfg(feature = "alloc")]
    impl core::ops::Deref for Inner {
        type Target = [u8];
        fn deref(&self) -> &[u8] {
            &self.0
        }
    }

    #[cfg(not(feature = "alloc"))]
    pub type FrameBuf = heapless::Vec<u8, MESSAGE_MAX>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_then_parse_roundtrips() {
        let payload = [0x10, 0x01, 0x02, 0x03];
        let frame = build_frame(5, &payload).unwrap();
        let parsed = parse(&frame).unwrap().unwrap();
        assert_eq!(parsed.seq, 5);
        assert_eq!(parsed.consumed, frame.len());
        assert_eq!(&frame[parsed.payload_start..parsed.payload_end], &payload);
    }

    #[test]
    fn seq_wraps_into_low_nibble() {
        let frame = build_frame(0x37, &[]).unwrap();
        // high nibble of the sequence byte is always the 0x10 marker
        assert_eq!(frame[1] & 0xf0, 0x10);
        assert_eq!(frame[1] & 0x0f, 0x37 & 0x0f);
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let frame = build_frame(1, &[1, 2, 3]).unwrap();
        assert!(parse(&frame[..frame.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn corrupt_crc_is_rejected() {
        let built = build_frame(1, &[1, 2, 3]).unwrap();
        let mut frame = built.to_vec();
        let last_crc_byte = frame.len() - 2;
        frame[last_crc_byte] ^= 0xff;
        let err = parse(&frame).unwrap_err();
        assert_eq!(err, (Error::InvalidCrc, 1));
    }

    #[test]
    fn bad_length_byte_is_rejected() {
        let buf = [0xffu8, 0, 0, 0, 0];
        assert_eq!(parse(&buf).unwrap_err(), (Error::InvalidSync, 1));
    }

    #[test]
    fn ack_frame_has_empty_payload() {
        let ack = build_ack(3);
        let parsed = parse(&ack).unwrap().unwrap();
        assert!(is_ack_frame(&parsed));
        assert_eq!(parsed.seq, 3);
    }
}
