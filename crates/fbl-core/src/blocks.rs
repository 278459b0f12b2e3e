//! Logical block table
//!
//! A logical block is an independently erasable and programmable region
//! (application, calibration, ...). The table is validated once at startup:
//! blocks are pairwise disjoint and never wrap the 32-bit address space.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::deserialize_hex_u32;

/// Block table validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockTableError {
    #[error("Block table magic 0x{found:08X} does not match 0x{expected:08X}")]
    BadMagic { expected: u32, found: u32 },

    #[error("Block table is empty")]
    Empty,

    #[error("Block table holds {0} blocks, at most 32 are supported")]
    TooManyBlocks(usize),

    #[error("Block number {0} does not fit the 32-bit validity bitmap")]
    NumberOutOfRange(u8),

    #[error("Duplicate block number {0}")]
    DuplicateNumber(u8),

    #[error("Block {0} has zero length")]
    ZeroLength(u8),

    #[error("Block {number} at 0x{start:08X} wraps the address space")]
    AddressOverflow { number: u8, start: u32 },

    #[error("Blocks {first} and {second} overlap")]
    Overlap { first: u8, second: u8 },
}

/// How a block's content is verified by the check memory routine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMode {
    /// CRC-32 (ISO-HDLC) accumulated over the transferred data
    #[default]
    Crc32,
    /// SHA-256 digest accumulated over the transferred data
    Sha256,
    /// SHA-256 digest handed to the security module as signature input
    Signature,
}

/// A logical block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalBlock {
    /// Block number, also its bit in the validity bitmap
    pub number: u8,

    #[serde(default)]
    pub name: String,

    #[serde(deserialize_with = "deserialize_hex_u32")]
    pub start: u32,

    #[serde(deserialize_with = "deserialize_hex_u32")]
    pub length: u32,

    /// Erase attempts allowed over the block's lifetime (0 = unlimited)
    #[serde(default)]
    pub max_program_attempts: u16,

    #[serde(default)]
    pub verification: VerificationMode,

    /// Required for the application to be considered valid
    #[serde(default)]
    pub mandatory: bool,
}

impl LogicalBlock {
    /// Exclusive end address. Valid for blocks in a validated table.
    pub fn end(&self) -> u32 {
        self.start.wrapping_add(self.length)
    }

    /// Whether `[address, address + length)` lies entirely inside this block
    pub fn contains(&self, address: u32, length: u32) -> bool {
        match address.checked_add(length) {
            Some(end) => address >= self.start && end <= self.end(),
            None => false,
        }
    }
}

/// Validated set of logical blocks
#[derive(Debug, Clone)]
pub struct LogicalBlockTable {
    blocks: Vec<LogicalBlock>,
}

impl LogicalBlockTable {
    /// Expected table marker ("FLB1")
    pub const MAGIC: u32 = 0x464C_4231;

    /// Validity is tracked in a 32-bit bitmap
    pub const MAX_BLOCKS: usize = 32;

    pub fn new(magic: u32, mut blocks: Vec<LogicalBlock>) -> Result<Self, BlockTableError> {
        if magic != Self::MAGIC {
            return Err(BlockTableError::BadMagic {
                expected: Self::MAGIC,
                found: magic,
            });
        }
        if blocks.is_empty() {
            return Err(BlockTableError::Empty);
        }
        if blocks.len() > Self::MAX_BLOCKS {
            return Err(BlockTableError::TooManyBlocks(blocks.len()));
        }

        for block in &blocks {
            if block.length == 0 {
                return Err(BlockTableError::ZeroLength(block.number));
            }
            if block.number as usize >= Self::MAX_BLOCKS {
                return Err(BlockTableError::NumberOutOfRange(block.number));
            }
            if block.start.checked_add(block.length).is_none() {
                return Err(BlockTableError::AddressOverflow {
                    number: block.number,
                    start: block.start,
                });
            }
        }

        blocks.sort_by_key(|b| b.start);
        for pair in blocks.windows(2) {
            if pair[0].end() > pair[1].start {
                return Err(BlockTableError::Overlap {
                    first: pair[0].number,
                    second: pair[1].number,
                });
            }
        }

        let mut numbers: Vec<u8> = blocks.iter().map(|b| b.number).collect();
        numbers.sort_unstable();
        if let Some(pair) = numbers.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(BlockTableError::DuplicateNumber(pair[0]));
        }

        Ok(Self { blocks })
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Blocks in ascending address order
    pub fn iter(&self) -> impl Iterator<Item = &LogicalBlock> {
        self.blocks.iter()
    }

    /// Look up a block by number
    pub fn get(&self, number: u8) -> Option<&LogicalBlock> {
        self.blocks.iter().find(|b| b.number == number)
    }

    /// The single block containing the whole range, if any
    pub fn resolve(&self, address: u32, length: u32) -> Option<&LogicalBlock> {
        if length == 0 {
            return None;
        }
        self.blocks.iter().find(|b| b.contains(address, length))
    }

    /// Bitmap with the bit of every mandatory block set
    pub fn mandatory_mask(&self) -> u32 {
        self.blocks
            .iter()
            .filter(|b| b.mandatory)
            .fold(0, |mask, b| mask | (1 << b.number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u8, start: u32, length: u32) -> LogicalBlock {
        LogicalBlock {
            number,
            name: format!("block{}", number),
            start,
            length,
            max_program_attempts: 0,
            verification: VerificationMode::Crc32,
            mandatory: number == 0,
        }
    }

    #[test]
    fn test_resolve_within_one_block() {
        let table = LogicalBlockTable::new(
            LogicalBlockTable::MAGIC,
            vec![block(0, 0x1000, 0x1000), block(1, 0x2000, 0x1000)],
        )
        .unwrap();

        assert_eq!(table.resolve(0x1000, 0x1000).map(|b| b.number), Some(0));
        assert_eq!(table.resolve(0x2800, 0x100).map(|b| b.number), Some(1));
        // Spans the boundary between blocks 0 and 1
        assert!(table.resolve(0x1F00, 0x200).is_none());
        assert!(table.resolve(0x0800, 0x10).is_none());
        assert!(table.resolve(0x1000, 0).is_none());
        assert!(table.resolve(0xFFFF_FFF0, 0x20).is_none());
    }

    #[test]
    fn test_rejects_bad_magic() {
        let err = LogicalBlockTable::new(0, vec![block(0, 0, 0x10)]).unwrap_err();
        assert!(matches!(err, BlockTableError::BadMagic { found: 0, .. }));
    }

    #[test]
    fn test_rejects_overflow() {
        let err = LogicalBlockTable::new(
            LogicalBlockTable::MAGIC,
            vec![block(0, 0xFFFF_F000, 0x2000)],
        )
        .unwrap_err();
        assert_eq!(
            err,
            BlockTableError::AddressOverflow {
                number: 0,
                start: 0xFFFF_F000
            }
        );
    }

    #[test]
    fn test_rejects_duplicates_and_overlap() {
        let dup = LogicalBlockTable::new(
            LogicalBlockTable::MAGIC,
            vec![block(0, 0x1000, 0x100), block(0, 0x2000, 0x100)],
        )
        .unwrap_err();
        assert_eq!(dup, BlockTableError::DuplicateNumber(0));

        let overlap = LogicalBlockTable::new(
            LogicalBlockTable::MAGIC,
            vec![block(1, 0x2000, 0x100), block(0, 0x1000, 0x1001)],
        )
        .unwrap_err();
        assert_eq!(overlap, BlockTableError::Overlap { first: 0, second: 1 });
    }

    #[test]
    fn test_mandatory_mask() {
        let mut cal = block(3, 0x4000, 0x100);
        cal.mandatory = true;
        let table = LogicalBlockTable::new(
            LogicalBlockTable::MAGIC,
            vec![block(0, 0x1000, 0x100), block(1, 0x2000, 0x100), cal],
        )
        .unwrap();
        assert_eq!(table.mandatory_mask(), 0b1001);
    }
}
