//! Data-processing pipeline between TransferData and the memory facade
//!
//! The RequestDownload data format identifier selects a [`DataProcessor`]
//! (decompression, decryption, ...). Format `0x00` is stored as received.

use thiserror::Error;

use crate::error::FblError;
use crate::uds::NegativeResponseCode;

/// Processing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    #[error("Malformed input: {0}")]
    Malformed(String),
}

impl From<ProcessingError> for FblError {
    fn from(_: ProcessingError) -> Self {
        FblError::Negative(NegativeResponseCode::TransferDataSuspended)
    }
}

/// Transforms received payload into the bytes written to memory
pub trait DataProcessor: Send {
    /// Consume `input`, appending produced bytes to `output`
    fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(), ProcessingError>;

    /// Emit any buffered bytes at the end of a transfer
    fn flush(&mut self, _output: &mut Vec<u8>) -> Result<(), ProcessingError> {
        Ok(())
    }
}

/// Format 0x00: unprocessed data
#[derive(Debug, Default)]
pub struct PassThrough;

impl DataProcessor for PassThrough {
    fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(), ProcessingError> {
        output.extend_from_slice(input);
        Ok(())
    }
}

/// Creates a fresh processor for each RequestDownload
pub type ProcessorFactory = fn() -> Box<dyn DataProcessor>;

/// Processors keyed by data format identifier
#[derive(Clone)]
pub struct ProcessorRegistry {
    entries: Vec<(u8, ProcessorFactory)>,
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(format, _)| format))
            .finish()
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        let mut registry = Self {
            entries: Vec::new(),
        };
        registry.register(Self::UNPROCESSED, || Box::new(PassThrough));
        registry
    }
}

impl ProcessorRegistry {
    /// Data format identifier for unprocessed data
    pub const UNPROCESSED: u8 = 0x00;

    /// Add or replace the processor for a data format identifier
    pub fn register(&mut self, format: u8, factory: ProcessorFactory) -> &mut Self {
        self.entries.retain(|(f, _)| *f != format);
        self.entries.push((format, factory));
        self
    }

    /// Instantiate the processor for `format`
    pub fn create(&self, format: u8) -> Option<Box<dyn DataProcessor>> {
        self.entries
            .iter()
            .find(|(f, _)| *f == format)
            .map(|(_, factory)| factory())
    }
}
