//! Host implementations of the bootloader's hardware seams

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fbl_core::{
    LogicalBlockTable, MemoryDriver, MemoryError, MetadataStore, NegativeResponseCode, NvError,
    NvHandle, ProgrammingConditions, SecurityModule, Watchdog, WatchdogPoll,
};
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

// =============================================================================
// Clock
// =============================================================================

/// Monotonic millisecond time base. There is no watchdog to feed on the host;
/// triggers are only counted.
#[derive(Debug)]
pub struct HostClock {
    last: Instant,
    triggers: u64,
}

impl HostClock {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
            triggers: 0,
        }
    }

    pub fn triggers(&self) -> u64 {
        self.triggers
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Watchdog for HostClock {
    fn trigger(&mut self) {
        self.triggers += 1;
    }

    fn elapsed_ms(&mut self) -> u32 {
        let elapsed = self.last.elapsed().as_millis().min(u32::MAX as u128) as u32;
        // Carry the sub-millisecond remainder into the next call
        self.last += Duration::from_millis(elapsed as u64);
        elapsed
    }
}

// =============================================================================
// Security
// =============================================================================

/// Seed/key module with random seeds. The key is the seed XORed with the
/// shared secret; signatures use the same scheme over the block digest.
#[derive(Debug, Clone)]
pub struct SharedSecretSecurity {
    secret: Vec<u8>,
    seed_length: usize,
}

impl SharedSecretSecurity {
    pub fn new(secret: Vec<u8>, seed_length: usize) -> Self {
        Self {
            secret,
            seed_length,
        }
    }

    pub fn key_for(&self, seed: &[u8]) -> Vec<u8> {
        if self.secret.is_empty() {
            return seed.to_vec();
        }
        seed.iter()
            .enumerate()
            .map(|(i, b)| b ^ self.secret[i % self.secret.len()])
            .collect()
    }
}

impl SecurityModule for SharedSecretSecurity {
    fn generate_seed(&mut self) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        // An all-zero seed means "already unlocked"
        loop {
            let seed: Vec<u8> = (0..self.seed_length).map(|_| rng.gen()).collect();
            if seed.iter().any(|&b| b != 0) {
                return seed;
            }
        }
    }

    fn compare_key(&mut self, key: &[u8], seed: &[u8]) -> bool {
        let expected = self.key_for(seed);
        if key != expected.as_slice() {
            debug!(
                expected = %hex::encode(&expected),
                received = %hex::encode(key),
                "Key mismatch"
            );
            return false;
        }
        true
    }

    fn verify(&mut self, data: &[u8], expected: &[u8]) -> bool {
        expected == self.key_for(data).as_slice()
    }
}

// =============================================================================
// Metadata store
// =============================================================================

/// Metadata records persisted as a JSON object of hex strings, keyed by
/// handle. The whole file is rewritten on every write.
#[derive(Debug)]
pub struct JsonMetadataStore {
    path: PathBuf,
    records: BTreeMap<String, String>,
}

impl JsonMetadataStore {
    /// Open the store, starting empty if the file does not exist
    pub fn open(path: impl AsRef<Path>) -> Result<Self, NvError> {
        let path = path.as_ref().to_path_buf();
        let records = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| NvError::Storage(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No metadata file, starting blank");
                BTreeMap::new()
            }
            Err(e) => return Err(NvError::Storage(format!("{}: {}", path.display(), e))),
        };
        Ok(Self { path, records })
    }

    fn key(handle: NvHandle) -> String {
        format!("0x{:04X}", handle.0)
    }

    fn persist(&self) -> Result<(), NvError> {
        let content = serde_json::to_string_pretty(&self.records)
            .map_err(|e| NvError::Storage(e.to_string()))?;
        std::fs::write(&self.path, content)
            .map_err(|e| NvError::Storage(format!("{}: {}", self.path.display(), e)))
    }
}

impl MetadataStore for JsonMetadataStore {
    fn read(&mut self, handle: NvHandle, buffer: &mut [u8]) -> Result<(), NvError> {
        let record = self
            .records
            .get(&Self::key(handle))
            .ok_or(NvError::NotFound(handle.0))?;
        let bytes = hex::decode(record).map_err(|e| {
            warn!(handle = %Self::key(handle), error = %e, "Corrupt metadata record");
            NvError::Storage(e.to_string())
        })?;
        if bytes.len() != buffer.len() {
            return Err(NvError::LengthMismatch {
                handle: handle.0,
                expected: buffer.len(),
                actual: bytes.len(),
            });
        }
        buffer.copy_from_slice(&bytes);
        Ok(())
    }

    fn write(&mut self, handle: NvHandle, data: &[u8]) -> Result<(), NvError> {
        self.records.insert(Self::key(handle), hex::encode(data));
        self.persist()
    }
}

// =============================================================================
// Flash
// =============================================================================

struct FlashCells {
    start: u32,
    cells: Vec<u8>,
}

impl FlashCells {
    fn offset(&self, address: u32, length: usize) -> Option<usize> {
        let offset = address.checked_sub(self.start)? as usize;
        (offset + length <= self.cells.len()).then_some(offset)
    }
}

/// RAM-backed flash device. Clones share the cells, so the content outlives
/// the bootloader instance that programmed it.
#[derive(Clone)]
pub struct SimFlash {
    cells: Arc<Mutex<FlashCells>>,
}

impl SimFlash {
    pub const ERASED: u8 = 0xFF;
    /// Bytes erased between two watchdog polls
    pub const POLL_INTERVAL: usize = 256;

    pub fn new(start: u32, length: u32) -> Self {
        Self {
            cells: Arc::new(Mutex::new(FlashCells {
                start,
                cells: vec![Self::ERASED; length as usize],
            })),
        }
    }

    /// Start address and length of the device
    pub fn range(&self) -> (u32, u32) {
        let cells = self.cells.lock();
        (cells.start, cells.cells.len() as u32)
    }

    /// Copy of the device content, `None` outside the device
    pub fn contents(&self, address: u32, length: usize) -> Option<Vec<u8>> {
        let cells = self.cells.lock();
        let offset = cells.offset(address, length)?;
        Some(cells.cells[offset..offset + length].to_vec())
    }
}

impl MemoryDriver for SimFlash {
    fn init(&mut self) -> Result<(), MemoryError> {
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), MemoryError> {
        Ok(())
    }

    fn erase(
        &mut self,
        address: u32,
        length: u32,
        poll: &mut dyn WatchdogPoll,
    ) -> Result<(), MemoryError> {
        let mut done = 0usize;
        while done < length as usize {
            let step = Self::POLL_INTERVAL.min(length as usize - done);
            {
                let mut cells = self.cells.lock();
                let at = address + done as u32;
                let offset = cells.offset(at, step).ok_or(MemoryError::Erase(at))?;
                cells.cells[offset..offset + step].fill(Self::ERASED);
            }
            done += step;
            poll.poll();
        }
        debug!(address = format!("0x{:08X}", address), length, "Flash erased");
        Ok(())
    }

    fn write(
        &mut self,
        address: u32,
        data: &[u8],
        poll: &mut dyn WatchdogPoll,
    ) -> Result<(), MemoryError> {
        {
            let mut cells = self.cells.lock();
            let offset = cells
                .offset(address, data.len())
                .ok_or(MemoryError::Write(address))?;
            let target = &mut cells.cells[offset..offset + data.len()];
            // Programmed cells cannot be written again without an erase
            if let Some(pos) = target.iter().position(|&c| c != Self::ERASED) {
                return Err(MemoryError::Write(address + pos as u32));
            }
            target.copy_from_slice(data);
        }
        poll.poll();
        Ok(())
    }

    fn read(
        &mut self,
        address: u32,
        buffer: &mut [u8],
        _poll: &mut dyn WatchdogPoll,
    ) -> Result<(), MemoryError> {
        let cells = self.cells.lock();
        let offset = cells
            .offset(address, buffer.len())
            .ok_or(MemoryError::Read(address))?;
        buffer.copy_from_slice(&cells.cells[offset..offset + buffer.len()]);
        Ok(())
    }
}

// =============================================================================
// Programming conditions
// =============================================================================

/// A parked vehicle: programming is always allowed and every block
/// combination is compatible
#[derive(Debug, Clone, Copy, Default)]
pub struct ParkedVehicle;

impl ProgrammingConditions for ParkedVehicle {
    fn check_preconditions(&mut self) -> Result<(), NegativeResponseCode> {
        Ok(())
    }

    fn check_compatibility(&mut self, _blocks: &LogicalBlockTable, _validity: u32) -> bool {
        true
    }
}
