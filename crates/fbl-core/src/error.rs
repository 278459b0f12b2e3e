//! Error types for the bootloader core
//!
//! Every operation that can change protocol state returns an [`FblResult`].
//! A [`FblError::Negative`] is recoverable and becomes a `7F sid nrc` frame;
//! a [`FblError::Fatal`] stops the bootloader until an external reset.

use thiserror::Error;

use crate::uds::NegativeResponseCode;

/// Conditions the bootloader cannot recover from without a reset
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    #[error("Internal invariant violated: {0}")]
    InvariantViolation(&'static str),

    #[error("Flash driver signature mismatch on device {0}")]
    FlashDriverSignature(String),

    #[error("Memory device {0} accessed while an operation is in progress")]
    DeviceBusy(String),
}

/// Result of a protocol operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FblError {
    #[error("Negative response: {0} (0x{0:02X})")]
    Negative(NegativeResponseCode),

    #[error("Fatal: {0}")]
    Fatal(#[from] FatalError),
}

impl FblError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// The NRC to put on the wire, `None` for fatal errors.
    pub fn nrc(&self) -> Option<NegativeResponseCode> {
        match self {
            Self::Negative(nrc) => Some(*nrc),
            Self::Fatal(_) => None,
        }
    }
}

impl From<NegativeResponseCode> for FblError {
    fn from(nrc: NegativeResponseCode) -> Self {
        Self::Negative(nrc)
    }
}

pub type FblResult<T> = Result<T, FblError>;
