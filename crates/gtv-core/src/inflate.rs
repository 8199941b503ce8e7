//! Optional streaming inflate layer.
//!
//! Enabled only once the server hello response carries the DEFLATE flag.
//! Pulls bytes out of the raw transport recv buffer and produces into its
//! own output ring buffer, which the [`crate::framer::Framer`] then drains
//! exactly as it would the raw recv buffer; the adapter is invisible to
//! framing.

use flate2::{Decompress, DecompressError, FlushDecompress, Status};
use gtv_utils::RingBuffer;
use thiserror::Error;

const PUMP_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum InflateError {
    #[error("deflate stream error: {0}")]
    Zlib(#[from] DecompressError),
}

/// Stateful zlib decoder sitting between a transport's raw recv buffer and
/// the Framer.
pub struct InflateAdapter {
    decompress: Decompress,
}

impl InflateAdapter {
    pub fn new() -> Self {
        Self { decompress: Decompress::new(true) }
    }

    /// Drains as much of `input` as will fit in `output`, inflating along
    /// the way. Stops when `input` is empty, `output` has no room, or a
    /// pump iteration makes no progress. On `Z_STREAM_END` the decoder is
    /// reset and decoding continues as a fresh zlib stream on the next call.
    pub fn pump(
        &mut self,
        input: &mut RingBuffer,
        output: &mut RingBuffer,
    ) -> Result<(), InflateError> {
        loop {
            if input.is_empty() || output.available() == 0 {
                break;
            }

            let in_slice = input.peek_all();
            let want_out = output.available().min(PUMP_CHUNK);
            let mut scratch = vec![0u8; want_out];

            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let status = self.decompress.decompress(in_slice, &mut scratch, FlushDecompress::Sync)?;
            let consumed = (self.decompress.total_in() - before_in) as usize;
            let produced = (self.decompress.total_out() - before_out) as usize;

            if produced > 0 {
                let wrote = output.write(&scratch[..produced]);
                debug_assert!(wrote, "output capacity checked via available() above");
            }
            if consumed > 0 {
                input.commit(consumed);
            }

            match status {
                Status::StreamEnd => self.decompress.reset(true),
                Status::Ok | Status::BufError => {
                    if consumed == 0 && produced == 0 {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for InflateAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use flate2::{Compress, Compression, FlushCompress};

    use super::*;

    fn zlib_compress(data: &[u8]) -> Vec<u8> {
        let mut compress = Compress::new(Compression::default(), true);
        let mut out = vec![0u8; data.len() * 2 + 64];
        let status =
            compress.compress(data, &mut out, FlushCompress::Sync).expect("compress");
        assert_ne!(status, flate2::Status::BufError);
        let produced = compress.total_out() as usize;
        out.truncate(produced);
        out
    }

    #[test]
    fn pump_inflates_into_output_buffer() {
        let plain = b"stream data frame payload bytes";
        let compressed = zlib_compress(plain);

        let mut input = RingBuffer::new(compressed.len() + 16);
        assert!(input.write(&compressed));
        let mut output = RingBuffer::new(plain.len() + 16);

        let mut adapter = InflateAdapter::new();
        adapter.pump(&mut input, &mut output).expect("pump");

        assert_eq!(output.peek_all(), plain.as_slice());
    }

    #[test]
    fn pump_across_fragmented_ticks_yields_same_bytes() {
        let plain = b"fragmented across multiple ticks of the deflate decoder";
        let compressed = zlib_compress(plain);

        let mut input = RingBuffer::new(compressed.len() + 16);
        let mut output = RingBuffer::new(plain.len() + 16);
        let mut adapter = InflateAdapter::new();

        for chunk in compressed.chunks(3) {
            assert!(input.write(chunk));
            adapter.pump(&mut input, &mut output).expect("pump");
        }

        assert_eq!(output.peek_all(), plain.as_slice());
    }
}
