//! Typed helpers for the `queue_step` command.
//!
//! `queue_step` is the hot path: the step compressor emits one of these for
//! every run it closes, so it is encoded directly rather than routed through
//! the general dictionary-driven [`crate::dictionary`] machinery.

use crate::vlq::{decode_int, decode_uint};
use crate::Error;

/// Parameters of a single `queue_step` command, as produced by the step
/// compressor's bisection search (see `mcu-link`'s `stepcompress` module).
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct CommandQueueStep {
    pub oid: u8,
    pub interval: u32,
    pub count: u16,
    pub add: i16,
}

/// Encodes `(oid, interval, count, add)` as VLQ parameters, prefixed with the
/// message's numeric id from the data dictionary.
pub fn encode_queue_step(msgid: u16, step: CommandQueueStep, out: &mut impl Extend<u8>) {
    crate::vlq::encode_uint(msgid as u32, out);
    out.extend(core::iter::once(step.oid));
    crate::vlq::encode_uint(step.interval, out);
    crate::vlq::encode_uint(step.count as u32, out);
    crate::vlq::encode_int(step.add as i32, out);
}

/// Inverse of [`encode_queue_step`]; `buf` must begin just after the msgid.
pub fn decode_queue_step(buf: &[u8]) -> Result<CommandQueueStep, Error> {
    let mut pos = 0;
    let oid = *buf.get(pos).ok_or(Error::IncompleteFrame)?;
    pos += 1;
    let (interval, n) = decode_uint(&buf[pos..])?;
    pos += n;
    let (count, n) = decode_uint(&buf[pos..])?;
    pos += n;
    let (add, n) = decode_int(&buf[pos..])?;
    pos += n;
    let _ = pos;
    Ok(CommandQueueStep {
        oid,
        interval,
        count: count as u16,
        add: add as i16,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_step_roundtrips() {
        let step = CommandQueueStep {
            oid: 4,
            interval: 100_000,
            count: 11,
            add: -7,
        };
        let mut buf: std::vec::Vec<u8> = std::vec::Vec::new();
        encode_queue_step(7, step, &mut buf);
        // strip the leading msgid VLQ the same way a frame reader would.
        let (_msgid, n) = decode_uint(&buf).unwrap();
        let decoded = decode_queue_step(&buf[n..]).unwrap();
        assert_eq!(decoded, step);
    }
}
