//! Memory driver facade
//!
//! Routes erase/write/read requests to the device that owns an address
//! range. Devices are initialized lazily on first use. A single "active"
//! marker guards against starting a device operation while another one is
//! still running.

use thiserror::Error;
use tracing::{debug, error};

use crate::error::{FatalError, FblError};
use crate::uds::NegativeResponseCode;

/// Memory device errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Range 0x{address:08X}+0x{length:X} is not mapped to a device")]
    Unmapped { address: u32, length: u32 },

    #[error("Device {0} is busy")]
    DeviceBusy(String),

    #[error("Device {0} driver signature mismatch")]
    SignatureMismatch(String),

    #[error("Erase failed at 0x{0:08X}")]
    Erase(u32),

    #[error("Write failed at 0x{0:08X}")]
    Write(u32),

    #[error("Read failed at 0x{0:08X}")]
    Read(u32),

    #[error("Verify mismatch at 0x{0:08X}")]
    Verify(u32),
}

impl From<MemoryError> for FblError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::SignatureMismatch(device) => {
                FblError::Fatal(FatalError::FlashDriverSignature(device))
            }
            MemoryError::DeviceBusy(device) => FblError::Fatal(FatalError::DeviceBusy(device)),
            MemoryError::Unmapped { .. } => {
                FblError::Negative(NegativeResponseCode::RequestOutOfRange)
            }
            _ => FblError::Negative(NegativeResponseCode::GeneralProgrammingFailure),
        }
    }
}

/// Cooperative yield point handed to long-running memory operations.
///
/// Implementations retrigger the watchdog and advance the supervisory
/// timers. They never dispatch requests.
pub trait WatchdogPoll {
    fn poll(&mut self);
}

/// A physical memory device
///
/// `erase`, `write` and `read` must call `poll` at a bounded interval while
/// they run.
pub trait MemoryDriver: Send {
    /// Prepare the device (load and check the flash driver)
    fn init(&mut self) -> Result<(), MemoryError>;

    fn deinit(&mut self) -> Result<(), MemoryError>;

    fn erase(
        &mut self,
        address: u32,
        length: u32,
        poll: &mut dyn WatchdogPoll,
    ) -> Result<(), MemoryError>;

    fn write(
        &mut self,
        address: u32,
        data: &[u8],
        poll: &mut dyn WatchdogPoll,
    ) -> Result<(), MemoryError>;

    fn read(
        &mut self,
        address: u32,
        buffer: &mut [u8],
        poll: &mut dyn WatchdogPoll,
    ) -> Result<(), MemoryError>;

    /// Compare device content against `expected`
    fn verify(
        &mut self,
        address: u32,
        expected: &[u8],
        poll: &mut dyn WatchdogPoll,
    ) -> Result<(), MemoryError> {
        let mut actual = vec![0u8; expected.len()];
        self.read(address, &mut actual, poll)?;
        match actual.iter().zip(expected).position(|(a, e)| a != e) {
            Some(offset) => Err(MemoryError::Verify(address + offset as u32)),
            None => Ok(()),
        }
    }
}

struct MemoryDevice {
    name: String,
    start: u32,
    length: u32,
    driver: Box<dyn MemoryDriver>,
    initialized: bool,
}

impl MemoryDevice {
    fn contains(&self, address: u32, length: u32) -> bool {
        match (address.checked_add(length), self.start.checked_add(self.length)) {
            (Some(end), Some(device_end)) => address >= self.start && end <= device_end,
            _ => false,
        }
    }
}

/// Address-range multiplexer over memory devices
pub struct MemoryFacade {
    devices: Vec<MemoryDevice>,
    active: Option<usize>,
    write_chunk: usize,
}

impl std::fmt::Debug for MemoryFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryFacade")
            .field(
                "devices",
                &self.devices.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
            )
            .field("active", &self.active)
            .finish()
    }
}

impl Default for MemoryFacade {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFacade {
    /// Bytes written between two watchdog polls
    pub const DEFAULT_WRITE_CHUNK: usize = 256;

    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            active: None,
            write_chunk: Self::DEFAULT_WRITE_CHUNK,
        }
    }

    pub fn with_write_chunk(mut self, write_chunk: usize) -> Self {
        self.write_chunk = write_chunk.max(1);
        self
    }

    /// Register a device covering `[start, start + length)`
    pub fn add_device(
        &mut self,
        name: impl Into<String>,
        start: u32,
        length: u32,
        driver: Box<dyn MemoryDriver>,
    ) -> &mut Self {
        self.devices.push(MemoryDevice {
            name: name.into(),
            start,
            length,
            driver,
            initialized: false,
        });
        self
    }

    /// Name of the device with an operation in progress
    pub fn active_device(&self) -> Option<&str> {
        self.active.map(|index| self.devices[index].name.as_str())
    }

    pub fn erase(
        &mut self,
        address: u32,
        length: u32,
        poll: &mut dyn WatchdogPoll,
    ) -> Result<(), MemoryError> {
        let index = self.begin(address, length)?;
        let device = &mut self.devices[index];
        debug!(
            device = %device.name,
            address = format!("0x{:08X}", address),
            length,
            "Erasing"
        );
        let result = device.driver.erase(address, length, poll);
        self.end();
        result
    }

    /// Write `data` in chunks, polling the watchdog between chunks, then
    /// verify it against the device content
    pub fn write(
        &mut self,
        address: u32,
        data: &[u8],
        poll: &mut dyn WatchdogPoll,
    ) -> Result<(), MemoryError> {
        let index = self.begin(address, data.len() as u32)?;
        let chunk_size = self.write_chunk;
        let device = &mut self.devices[index];

        let mut result = Ok(());
        let mut offset = 0usize;
        for chunk in data.chunks(chunk_size) {
            if offset > 0 {
                poll.poll();
            }
            result = device
                .driver
                .write(address + offset as u32, chunk, poll);
            if result.is_err() {
                break;
            }
            offset += chunk.len();
        }
        if result.is_ok() {
            result = device.driver.verify(address, data, poll);
        }

        self.end();
        result
    }

    pub fn read(
        &mut self,
        address: u32,
        buffer: &mut [u8],
        poll: &mut dyn WatchdogPoll,
    ) -> Result<(), MemoryError> {
        let index = self.begin(address, buffer.len() as u32)?;
        let result = self.devices[index].driver.read(address, buffer, poll);
        self.end();
        result
    }

    /// Shut down every initialized device
    pub fn deinit_all(&mut self) -> Result<(), MemoryError> {
        if let Some(name) = self.active_device() {
            return Err(MemoryError::DeviceBusy(name.to_string()));
        }
        for device in self.devices.iter_mut().filter(|d| d.initialized) {
            device.driver.deinit()?;
            device.initialized = false;
        }
        Ok(())
    }

    /// Resolve the device, initialize it on first use and mark it active
    fn begin(&mut self, address: u32, length: u32) -> Result<usize, MemoryError> {
        if let Some(name) = self.active_device() {
            error!(device = %name, "Memory access while device is active");
            return Err(MemoryError::DeviceBusy(name.to_string()));
        }

        let index = self
            .devices
            .iter()
            .position(|d| d.contains(address, length))
            .ok_or(MemoryError::Unmapped { address, length })?;

        let device = &mut self.devices[index];
        if !device.initialized {
            device.driver.init()?;
            device.initialized = true;
            debug!(device = %device.name, "Memory device initialized");
        }

        self.active = Some(index);
        Ok(index)
    }

    fn end(&mut self) {
        self.active = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RamFlash;

    struct CountingPoll(usize);

    impl WatchdogPoll for CountingPoll {
        fn poll(&mut self) {
            self.0 += 1;
        }
    }

    fn facade(flash: &RamFlash) -> MemoryFacade {
        let mut facade = MemoryFacade::new().with_write_chunk(16);
        facade.add_device("flash", 0x1000, 0x1000, Box::new(flash.clone()));
        facade
    }

    #[test]
    fn test_write_polls_between_chunks() {
        let flash = RamFlash::new(0x1000, 0x1000);
        let mut facade = facade(&flash);
        let mut poll = CountingPoll(0);

        facade.erase(0x1000, 0x100, &mut poll).unwrap();
        facade.write(0x1000, &[0xA5; 64], &mut poll).unwrap();

        assert!(poll.0 >= 3, "expected a poll between chunks, got {}", poll.0);
        assert_eq!(flash.contents(0x1000, 64), vec![0xA5; 64]);
        assert_eq!(facade.active_device(), None);
    }

    #[test]
    fn test_unmapped_range() {
        let flash = RamFlash::new(0x1000, 0x1000);
        let mut facade = facade(&flash);
        let err = facade
            .erase(0x1F00, 0x200, &mut CountingPoll(0))
            .unwrap_err();
        assert_eq!(
            err,
            MemoryError::Unmapped {
                address: 0x1F00,
                length: 0x200
            }
        );
        assert_eq!(
            FblError::from(err),
            FblError::Negative(NegativeResponseCode::RequestOutOfRange)
        );
    }

    #[test]
    fn test_signature_mismatch_is_fatal() {
        let flash = RamFlash::new(0x1000, 0x1000);
        flash.fail_init_with_signature_mismatch();
        let mut facade = facade(&flash);
        let err = facade
            .erase(0x1000, 0x100, &mut CountingPoll(0))
            .unwrap_err();
        assert!(FblError::from(err).is_fatal());
    }

    #[test]
    fn test_write_failure_maps_to_programming_failure() {
        let flash = RamFlash::new(0x1000, 0x1000);
        flash.fail_writes_at(0x1010);
        let mut facade = facade(&flash);
        let mut poll = CountingPoll(0);
        facade.erase(0x1000, 0x100, &mut poll).unwrap();
        let err = facade.write(0x1000, &[0x11; 32], &mut poll).unwrap_err();
        assert_eq!(err, MemoryError::Write(0x1010));
        assert_eq!(
            FblError::from(err),
            FblError::Negative(NegativeResponseCode::GeneralProgrammingFailure)
        );
        assert_eq!(facade.active_device(), None);
    }
}
