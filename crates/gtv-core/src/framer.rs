//! Length-prefixed message framing shared by the network stream and the
//! on-disk demo format.
//!
//! A `Framer` is oblivious to where its bytes come from: the same
//! `try_read_message` call drains a raw transport recv buffer or an
//! [`crate::inflate::InflateAdapter`]'s output buffer, since both are a
//! [`gtv_utils::RingBuffer`].

use gtv_utils::RingBuffer;
use thiserror::Error;

use crate::wire::{MAX_MSGLEN, MVD_MAGIC};

#[derive(Debug, Error)]
pub enum FramerError {
    #[error("bad magic preamble")]
    BadMagic,
    #[error("oversize message length {0} (max {MAX_MSGLEN})")]
    Oversize(usize),
}

#[derive(Debug, PartialEq, Eq)]
pub enum MessageOutcome {
    /// A complete payload was copied into the caller's scratch buffer.
    Payload,
    /// A zero-length record: orderly end of stream.
    EndOfStream,
}

/// Per-connection framing state. Tracks only whether the 4-byte preamble has
/// been validated yet; message boundaries live entirely in the ring buffer
/// being drained, so a `Framer` has no other state to carry across calls.
#[derive(Debug, Default)]
pub struct Framer {
    magic_validated: bool,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn magic_validated(&self) -> bool {
        self.magic_validated
    }

    /// Validates the 4-byte magic preamble if it hasn't been already.
    /// Returns `Ok(true)` once validated (a no-op on subsequent calls),
    /// `Ok(false)` if not enough bytes are buffered yet.
    pub fn validate_magic(&mut self, buf: &mut RingBuffer) -> Result<bool, FramerError> {
        if self.magic_validated {
            return Ok(true);
        }
        let Some(peeked) = buf.peek(MVD_MAGIC.len()) else {
            return Ok(false);
        };
        if peeked != MVD_MAGIC {
            return Err(FramerError::BadMagic);
        }
        buf.commit(MVD_MAGIC.len());
        self.magic_validated = true;
        Ok(true)
    }

    /// Attempts to extract one `(u16 length LE, payload)` record from `buf`.
    /// On success the payload (if any) is copied into `out`, replacing its
    /// previous contents, and the record is committed from `buf`. Returns
    /// `Ok(None)` if fewer than a full record is currently buffered; the
    /// caller should retry on the next tick once more bytes have arrived.
    pub fn try_read_message(
        &mut self,
        buf: &mut RingBuffer,
        out: &mut Vec<u8>,
    ) -> Result<Option<MessageOutcome>, FramerError> {
        let Some(header) = buf.peek(2) else {
            return Ok(None);
        };
        let len = u16::from_le_bytes([header[0], header[1]]) as usize;

        if len == 0 {
            buf.commit(2);
            out.clear();
            return Ok(Some(MessageOutcome::EndOfStream));
        }
        if len > MAX_MSGLEN {
            return Err(FramerError::Oversize(len));
        }

        let Some(record) = buf.peek(2 + len) else {
            return Ok(None);
        };
        out.clear();
        out.extend_from_slice(&record[2..2 + len]);
        buf.commit(2 + len);
        Ok(Some(MessageOutcome::Payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_with(bytes: &[u8]) -> RingBuffer {
        let mut rb = RingBuffer::new(bytes.len().max(64));
        assert!(rb.write(bytes));
        rb
    }

    #[test]
    fn validate_magic_accepts_preamble() {
        let mut framer = Framer::new();
        let mut buf = ring_with(&MVD_MAGIC);
        assert_eq!(framer.validate_magic(&mut buf).unwrap(), true);
        assert!(framer.magic_validated());
        assert!(buf.is_empty());
    }

    #[test]
    fn validate_magic_rejects_mismatch() {
        let mut framer = Framer::new();
        let mut buf = ring_with(b"NOPE");
        assert!(framer.validate_magic(&mut buf).is_err());
    }

    #[test]
    fn validate_magic_waits_for_more_bytes() {
        let mut framer = Framer::new();
        let mut buf = ring_with(b"MV");
        assert_eq!(framer.validate_magic(&mut buf).unwrap(), false);
    }

    #[test]
    fn reads_one_message_per_call() {
        let mut framer = Framer::new();
        let mut buf = RingBuffer::new(64);
        assert!(buf.write(&3u16.to_le_bytes()));
        assert!(buf.write(b"abc"));
        assert!(buf.write(&2u16.to_le_bytes()));
        assert!(buf.write(b"xy"));

        let mut scratch = Vec::new();
        assert_eq!(
            framer.try_read_message(&mut buf, &mut scratch).unwrap(),
            Some(MessageOutcome::Payload)
        );
        assert_eq!(scratch, b"abc");

        assert_eq!(
            framer.try_read_message(&mut buf, &mut scratch).unwrap(),
            Some(MessageOutcome::Payload)
        );
        assert_eq!(scratch, b"xy");
        assert!(buf.is_empty());
    }

    #[test]
    fn zero_length_record_is_end_of_stream() {
        let mut framer = Framer::new();
        let mut buf = RingBuffer::new(8);
        assert!(buf.write(&0u16.to_le_bytes()));
        let mut scratch = Vec::new();
        assert_eq!(
            framer.try_read_message(&mut buf, &mut scratch).unwrap(),
            Some(MessageOutcome::EndOfStream)
        );
    }

    #[test]
    fn oversize_length_is_fatal() {
        let mut framer = Framer::new();
        let mut buf = RingBuffer::new(8);
        assert!(buf.write(&((MAX_MSGLEN + 1) as u16).to_le_bytes()));
        let mut scratch = Vec::new();
        assert!(framer.try_read_message(&mut buf, &mut scratch).is_err());
    }

    #[test]
    fn partial_record_waits_for_more_bytes() {
        let mut framer = Framer::new();
        let mut buf = RingBuffer::new(8);
        assert!(buf.write(&5u16.to_le_bytes()));
        assert!(buf.write(b"ab"));
        let mut scratch = Vec::new();
        assert_eq!(framer.try_read_message(&mut buf, &mut scratch).unwrap(), None);
    }
}
