//! Persistent metadata
//!
//! The bootloader keeps its non-volatile bookkeeping behind a narrow
//! read/write-by-handle store. [`Metadata`] layers typed accessors on top.

use thiserror::Error;

use crate::error::FblError;
use crate::uds::NegativeResponseCode;

/// Length of a block fingerprint record
pub const FINGERPRINT_LEN: usize = 9;

pub type Fingerprint = [u8; FINGERPRINT_LEN];

/// Metadata store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NvError {
    #[error("Handle 0x{0:04X} has never been written")]
    NotFound(u16),

    #[error("Handle 0x{handle:04X} holds {actual} bytes, expected {expected}")]
    LengthMismatch {
        handle: u16,
        expected: usize,
        actual: usize,
    },

    #[error("Metadata storage failure: {0}")]
    Storage(String),
}

impl From<NvError> for FblError {
    fn from(_: NvError) -> Self {
        FblError::Negative(NegativeResponseCode::ConditionsNotCorrect)
    }
}

/// Opaque metadata handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NvHandle(pub u16);

/// Per-block metadata records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockField {
    Fingerprint,
    ProgCounter,
    ProgAttempts,
    CrcValue,
    CrcStart,
    CrcLength,
}

impl NvHandle {
    /// Application asked to be reprogrammed (1 byte)
    pub const PROG_REQUEST: Self = Self(0x0001);
    /// Sub-function of an ECUReset whose response is owed after reset (1 byte, 0 = none)
    pub const RESET_RESPONSE: Self = Self(0x0002);
    /// Application may be started (1 byte)
    pub const APPL_VALID: Self = Self(0x0003);
    /// Per-block validity bitmap (u32 BE, bit n = block n valid)
    pub const VALIDITY_FLAGS: Self = Self(0x0004);
    /// Security lockout delay active (1 byte)
    pub const SEC_DELAY_FLAG: Self = Self(0x0010);
    /// Consecutive invalid keys (1 byte)
    pub const SEC_ATTEMPTS: Self = Self(0x0011);

    const BLOCK_BASE: u16 = 0x0100;
    const BLOCK_STRIDE: u16 = 0x0010;

    /// Handle of a per-block record
    pub fn block(number: u8, field: BlockField) -> Self {
        let offset = match field {
            BlockField::Fingerprint => 0,
            BlockField::ProgCounter => 1,
            BlockField::ProgAttempts => 2,
            BlockField::CrcValue => 3,
            BlockField::CrcStart => 4,
            BlockField::CrcLength => 5,
        };
        Self(Self::BLOCK_BASE + number as u16 * Self::BLOCK_STRIDE + offset)
    }
}

/// Non-volatile key-value store
///
/// A record is read with the exact length it was written with. Reading a
/// handle that has never been written yields [`NvError::NotFound`].
pub trait MetadataStore: Send {
    fn read(&mut self, handle: NvHandle, buffer: &mut [u8]) -> Result<(), NvError>;

    fn write(&mut self, handle: NvHandle, data: &[u8]) -> Result<(), NvError>;
}

/// Typed access to the bootloader's metadata records.
///
/// Records that were never written read as zero.
pub struct Metadata {
    store: Box<dyn MetadataStore>,
}

impl std::fmt::Debug for Metadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metadata").finish_non_exhaustive()
    }
}

impl Metadata {
    pub fn new(store: Box<dyn MetadataStore>) -> Self {
        Self { store }
    }

    fn read_array<const N: usize>(&mut self, handle: NvHandle) -> Result<[u8; N], NvError> {
        let mut buffer = [0u8; N];
        match self.store.read(handle, &mut buffer) {
            Ok(()) => Ok(buffer),
            Err(NvError::NotFound(_)) => Ok([0u8; N]),
            Err(e) => Err(e),
        }
    }

    fn read_flag(&mut self, handle: NvHandle) -> Result<bool, NvError> {
        Ok(self.read_array::<1>(handle)?[0] != 0)
    }

    fn write_flag(&mut self, handle: NvHandle, value: bool) -> Result<(), NvError> {
        self.store.write(handle, &[value as u8])
    }

    fn read_u16(&mut self, handle: NvHandle) -> Result<u16, NvError> {
        Ok(u16::from_be_bytes(self.read_array(handle)?))
    }

    fn read_u32(&mut self, handle: NvHandle) -> Result<u32, NvError> {
        Ok(u32::from_be_bytes(self.read_array(handle)?))
    }

    pub fn prog_request(&mut self) -> Result<bool, NvError> {
        self.read_flag(NvHandle::PROG_REQUEST)
    }

    pub fn set_prog_request(&mut self, value: bool) -> Result<(), NvError> {
        self.write_flag(NvHandle::PROG_REQUEST, value)
    }

    /// Reset sub-function whose response is owed, if any
    pub fn reset_response(&mut self) -> Result<Option<u8>, NvError> {
        let value = self.read_array::<1>(NvHandle::RESET_RESPONSE)?[0];
        Ok((value != 0).then_some(value))
    }

    pub fn set_reset_response(&mut self, sub_function: Option<u8>) -> Result<(), NvError> {
        self.store
            .write(NvHandle::RESET_RESPONSE, &[sub_function.unwrap_or(0)])
    }

    pub fn appl_valid(&mut self) -> Result<bool, NvError> {
        self.read_flag(NvHandle::APPL_VALID)
    }

    pub fn set_appl_valid(&mut self, value: bool) -> Result<(), NvError> {
        self.write_flag(NvHandle::APPL_VALID, value)
    }

    /// Validity bitmap, bit n set when block n is valid
    pub fn validity(&mut self) -> Result<u32, NvError> {
        self.read_u32(NvHandle::VALIDITY_FLAGS)
    }

    pub fn block_valid(&mut self, number: u8) -> Result<bool, NvError> {
        Ok(self.validity()? & (1 << number) != 0)
    }

    /// Update one block's validity bit, leaving the others untouched
    pub fn set_block_valid(&mut self, number: u8, valid: bool) -> Result<(), NvError> {
        let mut bitmap = self.validity()?;
        if valid {
            bitmap |= 1 << number;
        } else {
            bitmap &= !(1 << number);
        }
        self.store
            .write(NvHandle::VALIDITY_FLAGS, &bitmap.to_be_bytes())
    }

    pub fn security_delay(&mut self) -> Result<bool, NvError> {
        self.read_flag(NvHandle::SEC_DELAY_FLAG)
    }

    pub fn set_security_delay(&mut self, active: bool) -> Result<(), NvError> {
        self.write_flag(NvHandle::SEC_DELAY_FLAG, active)
    }

    pub fn security_attempts(&mut self) -> Result<u8, NvError> {
        Ok(self.read_array::<1>(NvHandle::SEC_ATTEMPTS)?[0])
    }

    pub fn set_security_attempts(&mut self, count: u8) -> Result<(), NvError> {
        self.store.write(NvHandle::SEC_ATTEMPTS, &[count])
    }

    pub fn fingerprint(&mut self, block: u8) -> Result<Fingerprint, NvError> {
        self.read_array(NvHandle::block(block, BlockField::Fingerprint))
    }

    pub fn set_fingerprint(&mut self, block: u8, fingerprint: &Fingerprint) -> Result<(), NvError> {
        self.store
            .write(NvHandle::block(block, BlockField::Fingerprint), fingerprint)
    }

    pub fn prog_counter(&mut self, block: u8) -> Result<u16, NvError> {
        self.read_u16(NvHandle::block(block, BlockField::ProgCounter))
    }

    pub fn set_prog_counter(&mut self, block: u8, value: u16) -> Result<(), NvError> {
        self.store.write(
            NvHandle::block(block, BlockField::ProgCounter),
            &value.to_be_bytes(),
        )
    }

    pub fn prog_attempts(&mut self, block: u8) -> Result<u16, NvError> {
        self.read_u16(NvHandle::block(block, BlockField::ProgAttempts))
    }

    pub fn set_prog_attempts(&mut self, block: u8, value: u16) -> Result<(), NvError> {
        self.store.write(
            NvHandle::block(block, BlockField::ProgAttempts),
            &value.to_be_bytes(),
        )
    }

    /// Stored verification record: (value, start, length)
    pub fn crc_record(&mut self, block: u8) -> Result<(u32, u32, u32), NvError> {
        Ok((
            self.read_u32(NvHandle::block(block, BlockField::CrcValue))?,
            self.read_u32(NvHandle::block(block, BlockField::CrcStart))?,
            self.read_u32(NvHandle::block(block, BlockField::CrcLength))?,
        ))
    }

    pub fn set_crc_record(
        &mut self,
        block: u8,
        value: u32,
        start: u32,
        length: u32,
    ) -> Result<(), NvError> {
        self.store.write(
            NvHandle::block(block, BlockField::CrcValue),
            &value.to_be_bytes(),
        )?;
        self.store.write(
            NvHandle::block(block, BlockField::CrcStart),
            &start.to_be_bytes(),
        )?;
        self.store.write(
            NvHandle::block(block, BlockField::CrcLength),
            &length.to_be_bytes(),
        )
    }
}
