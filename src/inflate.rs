use std::io::Write;

use flate2::write::GzDecoder;

use crate::error;

/// Leading magic bytes of a gzip member
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Streaming gzip decompressor that accepts compressed bytes in arbitrary
/// chunks and appends their decompressed form to an internal rolling buffer.
///
/// A stream that ends mid-block is expected and normal: `feed` simply stops
/// producing output until more bytes arrive. Only decoder-reported corruption
/// and a missing gzip magic are errors. The buffer is append-only for the
/// lifetime of the inflater; growth is bounded by the caller, which stops
/// feeding once its stopping criterion is met.
pub struct IncrementalInflater {
    decoder: GzDecoder<Vec<u8>>,
    magic_seen: usize,
}

impl Default for IncrementalInflater {
    fn default() -> Self {
        Self::new()
    }
}

impl IncrementalInflater {
    pub fn new() -> Self {
        Self {
            decoder: GzDecoder::new(Vec::new()),
            magic_seen: 0,
        }
    }

    /// Feed one chunk of compressed bytes. Returns the number of new
    /// decompressed bytes appended to the buffer, which may be zero when the
    /// chunk ends inside a deflate block.
    pub fn feed(&mut self, chunk: &[u8]) -> crate::Result<usize> {
        if self.magic_seen < GZIP_MAGIC.len() {
            for (index, byte) in chunk.iter().take(GZIP_MAGIC.len() - self.magic_seen).enumerate()
            {
                snafu::ensure!(
                    *byte == GZIP_MAGIC[self.magic_seen + index],
                    error::NotGzipSnafu
                );
            }
            self.magic_seen = (self.magic_seen + chunk.len()).min(GZIP_MAGIC.len());
        }
        let before = self.decoder.get_ref().len();
        if let Err(source) = self.decoder.write_all(chunk) {
            return error::InflateSnafu {
                reason: source.to_string(),
            }
            .fail();
        }
        Ok(self.decoder.get_ref().len() - before)
    }

    /// Everything decompressed so far
    pub fn current_buffer(&self) -> &[u8] {
        self.decoder.get_ref()
    }

    pub fn bytes_decompressed(&self) -> usize {
        self.decoder.get_ref().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Error;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn gzip(payload: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_feed_whole_stream() {
        let payload = b"hello from inside a gzip member".repeat(64);
        let mut inflater = IncrementalInflater::new();
        inflater.feed(&gzip(&payload)).unwrap();
        assert_eq!(inflater.current_buffer(), payload.as_slice());
    }

    #[test]
    fn test_feed_in_small_chunks() {
        let payload = (0u32..4096).flat_map(|v| v.to_le_bytes()).collect::<Vec<_>>();
        let compressed = gzip(&payload);
        let mut inflater = IncrementalInflater::new();
        let mut produced = 0;
        for chunk in compressed.chunks(7) {
            produced += inflater.feed(chunk).unwrap();
        }
        assert_eq!(produced, payload.len());
        assert_eq!(inflater.current_buffer(), payload.as_slice());
    }

    #[test]
    fn test_truncated_stream_is_not_an_error() {
        // barely compressible payload so truncation lands mid-stream
        let mut state = 0x2545f491u64;
        let payload = (0..1 << 16)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect::<Vec<_>>();
        let compressed = gzip(&payload);
        let mut inflater = IncrementalInflater::new();
        inflater.feed(&compressed[..compressed.len() / 2]).unwrap();
        let buffer = inflater.current_buffer();
        assert!(!buffer.is_empty());
        assert!(buffer.len() < payload.len());
        assert_eq!(buffer, &payload[..buffer.len()]);
    }

    #[test]
    fn test_not_gzip_magic() {
        let mut inflater = IncrementalInflater::new();
        assert!(matches!(
            inflater.feed(b"PK\x03\x04"),
            Err(Error::NotGzip)
        ));
    }

    #[test]
    fn test_magic_split_across_feeds() {
        let compressed = gzip(b"split magic");
        let mut inflater = IncrementalInflater::new();
        inflater.feed(&compressed[..1]).unwrap();
        inflater.feed(&compressed[1..]).unwrap();
        assert_eq!(inflater.current_buffer(), b"split magic");

        let mut inflater = IncrementalInflater::new();
        inflater.feed(&[0x1f]).unwrap();
        assert!(matches!(inflater.feed(&[0x00]), Err(Error::NotGzip)));
    }

    #[test]
    fn test_corrupt_stream_reports_inflate_error() {
        let mut compressed = gzip(b"soon to be corrupted");
        // reserved deflate block type right after the member header
        compressed[10] = 0x07;
        let mut inflater = IncrementalInflater::new();
        assert!(matches!(
            inflater.feed(&compressed),
            Err(Error::Inflate { .. })
        ));
    }
}
