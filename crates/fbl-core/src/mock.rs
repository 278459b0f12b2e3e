//! In-memory collaborators for tests
//!
//! Every fake is a cheap handle around shared state, so a test can keep a
//! clone to inspect or steer the instance it boxed into the bootloader.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::blocks::LogicalBlockTable;
use crate::bootloader::{Bootloader, Drivers};
use crate::config::{ConfigError, FblConfig};
use crate::download::{ProcessorRegistry, ProgrammingConditions};
use crate::memory::{MemoryDriver, MemoryError, MemoryFacade, WatchdogPoll};
use crate::nvm::{MetadataStore, NvError, NvHandle};
use crate::security::SecurityModule;
use crate::timer::{Transport, Watchdog};
use crate::uds::{service_id, NegativeResponseCode};

// =============================================================================
// Flash
// =============================================================================

struct FlashState {
    start: u32,
    cells: Vec<u8>,
    fail_init_signature: bool,
    fail_erase: bool,
    fail_write_at: Option<u32>,
    /// Clock advanced per poll step of an erase
    erase_latency: Option<(ManualClock, u32)>,
    erase_count: usize,
}

/// RAM-backed flash device. Erased cells read 0xFF.
#[derive(Clone)]
pub struct RamFlash {
    state: Arc<Mutex<FlashState>>,
}

impl RamFlash {
    pub const ERASED: u8 = 0xFF;
    /// Bytes processed between two watchdog polls
    pub const POLL_INTERVAL: usize = 256;

    pub fn new(start: u32, length: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(FlashState {
                start,
                cells: vec![Self::ERASED; length as usize],
                fail_init_signature: false,
                fail_erase: false,
                fail_write_at: None,
                erase_latency: None,
                erase_count: 0,
            })),
        }
    }

    /// Start address and length of the device
    pub fn range(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.start, state.cells.len() as u32)
    }

    /// Copy of the device content
    pub fn contents(&self, address: u32, length: usize) -> Vec<u8> {
        let state = self.state.lock();
        let offset = (address - state.start) as usize;
        state.cells[offset..offset + length].to_vec()
    }

    pub fn erase_count(&self) -> usize {
        self.state.lock().erase_count
    }

    pub fn fail_init_with_signature_mismatch(&self) {
        self.state.lock().fail_init_signature = true;
    }

    pub fn fail_erase(&self) {
        self.state.lock().fail_erase = true;
    }

    /// Fail any write touching `address`
    pub fn fail_writes_at(&self, address: u32) {
        self.state.lock().fail_write_at = Some(address);
    }

    /// Let each erase step consume `ms_per_step` on `clock`
    pub fn set_erase_latency(&self, clock: &ManualClock, ms_per_step: u32) {
        self.state.lock().erase_latency = Some((clock.clone(), ms_per_step));
    }

    fn offset(state: &FlashState, address: u32, length: usize) -> Option<usize> {
        let offset = address.checked_sub(state.start)? as usize;
        (offset + length <= state.cells.len()).then_some(offset)
    }
}

impl MemoryDriver for RamFlash {
    fn init(&mut self) -> Result<(), MemoryError> {
        if self.state.lock().fail_init_signature {
            return Err(MemoryError::SignatureMismatch("ram-flash".to_string()));
        }
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
        let latency = {
            let mut state = self.state.lock();
            if state.fail_erase {
                return Err(MemoryError::Erase(address));
            }
            state.erase_count += 1;
            state.erase_latency.clone()
        };

        let mut done = 0usize;
        while done < length as usize {
            let step = Self::POLL_INTERVAL.min(length as usize - done);
            {
                let mut state = self.state.lock();
                let offset = Self::offset(&state, address + done as u32, step)
                    .ok_or(MemoryError::Erase(address + done as u32))?;
                state.cells[offset..offset + step].fill(Self::ERASED);
            }
            done += step;
            if let Some((clock, ms)) = &latency {
                clock.advance(*ms);
            }
            poll.poll();
        }
        Ok(())
    }

    fn write(
        &mut self,
        address: u32,
        data: &[u8],
        poll: &mut dyn WatchdogPoll,
    ) -> Result<(), MemoryError> {
        {
            let mut state = self.state.lock();
            if let Some(fail) = state.fail_write_at {
                if fail >= address && fail < address + data.len() as u32 {
                    return Err(MemoryError::Write(fail));
                }
            }
            let offset =
                Self::offset(&state, address, data.len()).ok_or(MemoryError::Write(address))?;
            let cells = &mut state.cells[offset..offset + data.len()];
            if let Some(pos) = cells.iter().position(|&c| c != Self::ERASED) {
                return Err(MemoryError::Write(address + pos as u32));
            }
            cells.copy_from_slice(data);
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
        let state = self.state.lock();
        let offset =
            Self::offset(&state, address, buffer.len()).ok_or(MemoryError::Read(address))?;
        buffer.copy_from_slice(&state.cells[offset..offset + buffer.len()]);
        Ok(())
    }
}

// =============================================================================
// Metadata store
// =============================================================================

/// HashMap-backed metadata store
#[derive(Clone, Default)]
pub struct RamMetadataStore {
    records: Arc<Mutex<HashMap<NvHandle, Vec<u8>>>>,
}

impl RamMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw record, if written
    pub fn record(&self, handle: NvHandle) -> Option<Vec<u8>> {
        self.records.lock().get(&handle).cloned()
    }
}

impl MetadataStore for RamMetadataStore {
    fn read(&mut self, handle: NvHandle, buffer: &mut [u8]) -> Result<(), NvError> {
        let records = self.records.lock();
        let record = records.get(&handle).ok_or(NvError::NotFound(handle.0))?;
        if record.len() != buffer.len() {
            return Err(NvError::LengthMismatch {
                handle: handle.0,
                expected: buffer.len(),
                actual: record.len(),
            });
        }
        buffer.copy_from_slice(record);
        Ok(())
    }

    fn write(&mut self, handle: NvHandle, data: &[u8]) -> Result<(), NvError> {
        self.records.lock().insert(handle, data.to_vec());
        Ok(())
    }
}

// =============================================================================
// Security
// =============================================================================

/// Seed/key module whose key is the seed XORed with a cycled secret.
/// Seeds are deterministic.
#[derive(Clone)]
pub struct XorSecurity {
    secret: Vec<u8>,
    counter: Arc<Mutex<u32>>,
}

impl XorSecurity {
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            counter: Arc::new(Mutex::new(0)),
        }
    }

    pub fn key_for(&self, seed: &[u8]) -> Vec<u8> {
        if self.secret.is_empty() {
            return seed.to_vec();
        }
        seed.iter()
            .zip(self.secret.iter().cycle())
            .map(|(s, k)| s ^ k)
            .collect()
    }
}

impl SecurityModule for XorSecurity {
    fn generate_seed(&mut self) -> Vec<u8> {
        let mut counter = self.counter.lock();
        *counter = counter.wrapping_add(1);
        let value = counter.wrapping_mul(0x9E37_79B9) | 0x0101_0101;
        value.to_be_bytes().to_vec()
    }

    fn compare_key(&mut self, key: &[u8], seed: &[u8]) -> bool {
        key == self.key_for(seed).as_slice()
    }

    fn verify(&mut self, data: &[u8], expected: &[u8]) -> bool {
        expected == self.key_for(data).as_slice()
    }
}

// =============================================================================
// Transport
// =============================================================================

#[derive(Default)]
struct TransportLog {
    frames: Vec<Vec<u8>>,
    pending: Vec<u8>,
}

/// Transport that records everything sent
#[derive(Clone, Default)]
pub struct RecordingTransport {
    log: Arc<Mutex<TransportLog>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every frame in send order, response-pending frames included
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.log.lock().frames.clone()
    }

    /// Final responses only
    pub fn responses(&self) -> Vec<Vec<u8>> {
        self.log
            .lock()
            .frames
            .iter()
            .filter(|f| !is_response_pending(f))
            .cloned()
            .collect()
    }

    pub fn last_response(&self) -> Option<Vec<u8>> {
        self.responses().pop()
    }

    /// Service ids of the response-pending frames sent
    pub fn pending_frames(&self) -> Vec<u8> {
        self.log.lock().pending.clone()
    }

    pub fn clear(&self) {
        let mut log = self.log.lock();
        log.frames.clear();
        log.pending.clear();
    }
}

fn is_response_pending(frame: &[u8]) -> bool {
    frame.len() == 3
        && frame[0] == service_id::NEGATIVE_RESPONSE
        && frame[2] == u8::from(NegativeResponseCode::ResponsePending)
}

impl Transport for RecordingTransport {
    fn send_response(&mut self, response: &[u8]) {
        self.log.lock().frames.push(response.to_vec());
    }

    fn send_response_pending(&mut self, service_id: u8) {
        let mut log = self.log.lock();
        log.frames.push(vec![
            service_id::NEGATIVE_RESPONSE,
            service_id,
            u8::from(NegativeResponseCode::ResponsePending),
        ]);
        log.pending.push(service_id);
    }
}

// =============================================================================
// Clock
// =============================================================================

#[derive(Default)]
struct ClockState {
    unread_ms: u32,
    triggers: usize,
}

/// Watchdog whose time only moves when told to
#[derive(Clone, Default)]
pub struct ManualClock {
    state: Arc<Mutex<ClockState>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: u32) {
        let mut state = self.state.lock();
        state.unread_ms = state.unread_ms.saturating_add(ms);
    }

    /// Number of watchdog retriggers so far
    pub fn triggers(&self) -> usize {
        self.state.lock().triggers
    }
}

impl Watchdog for ManualClock {
    fn trigger(&mut self) {
        self.state.lock().triggers += 1;
    }

    fn elapsed_ms(&mut self) -> u32 {
        std::mem::take(&mut self.state.lock().unread_ms)
    }
}

// =============================================================================
// Programming conditions
// =============================================================================

struct ConditionsState {
    preconditions: Result<(), NegativeResponseCode>,
    compatible: bool,
}

/// Programming conditions a test can flip at runtime. Ready and
/// compatible by default.
#[derive(Clone)]
pub struct ScriptedConditions {
    state: Arc<Mutex<ConditionsState>>,
}

impl Default for ScriptedConditions {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(ConditionsState {
                preconditions: Ok(()),
                compatible: true,
            })),
        }
    }
}

impl ScriptedConditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_preconditions(&self, result: Result<(), NegativeResponseCode>) {
        self.state.lock().preconditions = result;
    }

    pub fn set_compatible(&self, compatible: bool) {
        self.state.lock().compatible = compatible;
    }
}

impl ProgrammingConditions for ScriptedConditions {
    fn check_preconditions(&mut self) -> Result<(), NegativeResponseCode> {
        self.state.lock().preconditions
    }

    fn check_compatibility(&mut self, _blocks: &LogicalBlockTable, _validity: u32) -> bool {
        self.state.lock().compatible
    }
}

// =============================================================================
// Complete hardware
// =============================================================================

/// One of each fake, wired into a [`Bootloader`]. Cloning shares state, so
/// a rebuilt bootloader sees the same flash and metadata (a reset).
#[derive(Clone)]
pub struct MockHardware {
    pub flash: RamFlash,
    pub store: RamMetadataStore,
    pub security: XorSecurity,
    pub transport: RecordingTransport,
    pub clock: ManualClock,
    pub conditions: ScriptedConditions,
}

impl MockHardware {
    pub const SECRET: [u8; 4] = [0xA5, 0x5A, 0x3C, 0xC3];

    /// Fakes with one flash device spanning every configured block
    pub fn new(config: &FblConfig) -> Self {
        let start = config.blocks.blocks.iter().map(|b| b.start).min().unwrap_or(0);
        let end = config
            .blocks
            .blocks
            .iter()
            .map(|b| b.start.saturating_add(b.length))
            .max()
            .unwrap_or(start);
        Self {
            flash: RamFlash::new(start, end - start),
            store: RamMetadataStore::new(),
            security: XorSecurity::new(Self::SECRET.to_vec()),
            transport: RecordingTransport::new(),
            clock: ManualClock::new(),
            conditions: ScriptedConditions::new(),
        }
    }

    pub fn drivers(&self) -> Drivers {
        let (start, length) = self.flash.range();
        let mut memory = MemoryFacade::new();
        memory.add_device("flash", start, length, Box::new(self.flash.clone()));
        Drivers {
            watchdog: Box::new(self.clock.clone()),
            transport: Box::new(self.transport.clone()),
            memory,
            metadata: Box::new(self.store.clone()),
            security: Box::new(self.security.clone()),
            conditions: Box::new(self.conditions.clone()),
            processors: ProcessorRegistry::default(),
        }
    }

    pub fn bootloader(&self, config: FblConfig) -> Result<Bootloader, ConfigError> {
        Bootloader::new(config, self.drivers())
    }
}
