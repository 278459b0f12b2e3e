//! Transfer session state

use crc::{Crc, Digest, CRC_32_ISO_HDLC};
use sha2::{Digest as _, Sha256};

use super::pipeline::DataProcessor;
use crate::blocks::VerificationMode;

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// TransferData block sequence counter
///
/// Starts at 0x01 and wraps 0xFF -> 0x01; 0x00 is never expected mid-session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceCounter(u8);

impl Default for SequenceCounter {
    fn default() -> Self {
        Self(0x01)
    }
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expected(&self) -> u8 {
        self.0
    }

    pub fn advance(&mut self) {
        self.0 = if self.0 == 0xFF { 0x01 } else { self.0 + 1 };
    }
}

/// Running checksum over the bytes written to a block
pub enum ChecksumAccumulator {
    Crc32(Digest<'static, u32>),
    Sha256(Sha256),
}

impl std::fmt::Debug for ChecksumAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Crc32(_) => f.write_str("ChecksumAccumulator::Crc32"),
            Self::Sha256(_) => f.write_str("ChecksumAccumulator::Sha256"),
        }
    }
}

impl ChecksumAccumulator {
    pub fn new(mode: VerificationMode) -> Self {
        match mode {
            VerificationMode::Crc32 => Self::Crc32(CRC32.digest()),
            VerificationMode::Sha256 | VerificationMode::Signature => Self::Sha256(Sha256::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Crc32(digest) => digest.update(data),
            Self::Sha256(hasher) => hasher.update(data),
        }
    }

    /// Big-endian CRC-32 or the 32-byte SHA-256 digest
    pub fn finalize(self) -> Vec<u8> {
        match self {
            Self::Crc32(digest) => digest.finalize().to_be_bytes().to_vec(),
            Self::Sha256(hasher) => hasher.finalize().to_vec(),
        }
    }
}

/// Progress of programming one erased block, possibly over several
/// RequestDownload segments
#[derive(Debug)]
pub struct BlockProgress {
    /// Logical block number
    pub block: u8,
    /// Lowest address a further segment may start at
    pub next_address: u32,
    /// First address written, if any
    pub first_address: Option<u32>,
    /// Bytes written across all segments
    pub written: u32,
    pub accumulator: ChecksumAccumulator,
}

impl BlockProgress {
    pub fn new(block: u8, start: u32, mode: VerificationMode) -> Self {
        Self {
            block,
            next_address: start,
            first_address: None,
            written: 0,
            accumulator: ChecksumAccumulator::new(mode),
        }
    }

    /// Account for `data` written at `address`
    pub fn record(&mut self, address: u32, data: &[u8]) {
        self.first_address.get_or_insert(address);
        self.written = self.written.saturating_add(data.len() as u32);
        self.accumulator.update(data);
    }
}

/// One RequestDownload .. RequestTransferExit segment
pub struct TransferSession {
    pub current_address: u32,
    pub bytes_remaining: u32,
    pub sequence: SequenceCounter,
    pub retry_count: u8,
    pub processor: Box<dyn DataProcessor>,
}

impl std::fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSession")
            .field("current_address", &format_args!("0x{:08X}", self.current_address))
            .field("bytes_remaining", &self.bytes_remaining)
            .field("sequence", &self.sequence)
            .field("retry_count", &self.retry_count)
            .finish_non_exhaustive()
    }
}

impl TransferSession {
    pub fn new(
        address: u32,
        length: u32,
        retry_count: u8,
        processor: Box<dyn DataProcessor>,
    ) -> Self {
        Self {
            current_address: address,
            bytes_remaining: length,
            sequence: SequenceCounter::new(),
            retry_count,
            processor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0x01, 0x02)]
    #[case(0x7F, 0x80)]
    #[case(0xFE, 0xFF)]
    #[case(0xFF, 0x01)]
    fn test_sequence_counter_advance(#[case] from: u8, #[case] to: u8) {
        let mut counter = SequenceCounter(from);
        counter.advance();
        assert_eq!(counter.expected(), to);
    }

    #[test]
    fn test_sequence_counter_never_yields_zero() {
        let mut counter = SequenceCounter::new();
        for _ in 0..600 {
            counter.advance();
            assert_ne!(counter.expected(), 0x00);
        }
    }

    #[test]
    fn test_crc_accumulates_across_updates() {
        let mut acc = ChecksumAccumulator::new(VerificationMode::Crc32);
        acc.update(b"1234");
        acc.update(b"56789");
        // CRC-32/ISO-HDLC check value
        assert_eq!(acc.finalize(), 0xCBF4_3926u32.to_be_bytes().to_vec());
    }

    #[test]
    fn test_sha256_accumulator() {
        let mut acc = ChecksumAccumulator::new(VerificationMode::Sha256);
        acc.update(b"abc");
        let digest = acc.finalize();
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_block_progress_records_first_address() {
        let mut progress = BlockProgress::new(0, 0x1000, VerificationMode::Crc32);
        progress.record(0x1000, &[0; 16]);
        progress.record(0x1010, &[0; 16]);
        assert_eq!(progress.first_address, Some(0x1000));
        assert_eq!(progress.written, 32);
    }
}
