//! Bulk payload pattern.
//!
//! The payload is `block_count` copies of one block where `block[i] = i mod 256`.
//! There is no framing: the receiver reads until the sender closes.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::config::AwareConfig;

/// Shape of the bulk payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadPattern {
    pub block_len: usize,
    pub block_count: usize,
}

impl PayloadPattern {
    pub fn new(block_len: usize, block_count: usize) -> Self {
        Self {
            block_len,
            block_count,
        }
    }

    /// Pattern configured for a coordinator.
    pub fn from_config(config: &AwareConfig) -> Self {
        Self::new(config.block_len, config.block_count)
    }

    /// Total payload length in bytes.
    pub fn total_len(&self) -> u64 {
        self.block_len as u64 * self.block_count as u64
    }

    /// One block of the pattern.
    pub fn block(&self) -> Vec<u8> {
        (0..self.block_len).map(|i| (i % 256) as u8).collect()
    }

    /// Expected byte at an absolute payload offset.
    fn byte_at(&self, offset: u64) -> u8 {
        ((offset % self.block_len as u64) % 256) as u8
    }

    /// Write the whole payload to `writer`. Returns the bytes written.
    pub async fn write_to<W>(&self, writer: &mut W) -> std::io::Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let block = self.block();
        for _ in 0..self.block_count {
            writer.write_all(&block).await?;
        }
        writer.flush().await?;
        Ok(self.total_len())
    }

    /// Start verifying a received stream against this pattern.
    pub fn verifier(&self) -> PayloadVerifier {
        PayloadVerifier {
            pattern: *self,
            offset: 0,
            mismatch_at: None,
        }
    }
}

/// Streaming check of received bytes.
#[derive(Debug, Clone)]
pub struct PayloadVerifier {
    pattern: PayloadPattern,
    offset: u64,
    mismatch_at: Option<u64>,
}

impl PayloadVerifier {
    /// Feed the next chunk of received bytes.
    pub fn update(&mut self, chunk: &[u8]) {
        if self.mismatch_at.is_none() && self.pattern.block_len > 0 {
            for (i, byte) in chunk.iter().enumerate() {
                let offset = self.offset + i as u64;
                if offset >= self.pattern.total_len() || *byte != self.pattern.byte_at(offset) {
                    self.mismatch_at = Some(offset);
                    break;
                }
            }
        }
        self.offset += chunk.len() as u64;
    }

    /// Bytes seen so far.
    pub fn received(&self) -> u64 {
        self.offset
    }

    /// Offset of the first unexpected byte, if any.
    pub fn mismatch_at(&self) -> Option<u64> {
        self.mismatch_at
    }

    /// True when exactly the expected payload was received.
    pub fn is_intact(&self) -> bool {
        self.mismatch_at.is_none() && self.offset == self.pattern.total_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_BLOCK_COUNT, DEFAULT_BLOCK_LEN};

    #[tokio::test]
    async fn test_default_payload_is_byte_exact() {
        let pattern = PayloadPattern::new(DEFAULT_BLOCK_LEN, DEFAULT_BLOCK_COUNT);
        let mut out: Vec<u8> = Vec::new();
        let written = pattern.write_to(&mut out).await.unwrap();

        assert_eq!(written, 10_485_760);
        assert_eq!(out.len(), 10_485_760);
        for (block_index, block) in out.chunks(DEFAULT_BLOCK_LEN).enumerate() {
            for (i, byte) in block.iter().enumerate() {
                assert_eq!(*byte, (i % 256) as u8, "block {} byte {}", block_index, i);
            }
        }
    }

    #[test]
    fn test_verifier_accepts_pattern_in_odd_chunks() {
        let pattern = PayloadPattern::new(300, 3);
        let bytes: Vec<u8> = pattern.block().repeat(3);
        let mut verifier = pattern.verifier();
        for chunk in bytes.chunks(7) {
            verifier.update(chunk);
        }
        assert_eq!(verifier.received(), 900);
        assert!(verifier.is_intact());
    }

    #[test]
    fn test_verifier_detects_corruption_and_truncation() {
        let pattern = PayloadPattern::new(16, 2);
        let mut bytes = pattern.block().repeat(2);
        bytes[20] ^= 0xff;
        let mut verifier = pattern.verifier();
        verifier.update(&bytes);
        assert_eq!(verifier.mismatch_at(), Some(20));
        assert!(!verifier.is_intact());

        let mut short = pattern.verifier();
        short.update(&pattern.block());
        assert!(!short.is_intact());

        let mut long = pattern.verifier();
        long.update(&pattern.block().repeat(3));
        assert_eq!(long.mismatch_at(), Some(32));
    }
}
