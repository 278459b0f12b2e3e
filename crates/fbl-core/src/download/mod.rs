//! Download sequencer
//!
//! Orchestrates the reprogramming of one logical block at a time:
//! erase, one or more RequestDownload/TransferData/RequestTransferExit
//! segments, then verification. Every step checks its gate through the
//! [`SessionManager`] before touching memory.

mod pipeline;
mod transfer;

pub use pipeline::{DataProcessor, PassThrough, ProcessingError, ProcessorFactory, ProcessorRegistry};
pub use transfer::{BlockProgress, ChecksumAccumulator, SequenceCounter, TransferSession};

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::blocks::{LogicalBlockTable, VerificationMode};
use crate::config::{DependencyPolicy, EraseConfig, TransferConfig};
use crate::error::{FatalError, FblError, FblResult};
use crate::memory::MemoryFacade;
use crate::nvm::{Fingerprint, Metadata};
use crate::security::SecurityModule;
use crate::session::{Flag, SessionManager};
use crate::timer::{PollContext, Supervisor};
use crate::uds::{routine_id, MemoryRange, NegativeResponseCode};

/// Routine status byte: routine completed successfully
pub const ROUTINE_OK: u8 = 0x00;
/// Routine status byte: routine ran and failed
pub const ROUTINE_FAILED: u8 = 0x01;

/// Application-specific checks consulted by the bootloader
pub trait ProgrammingConditions: Send {
    /// Vehicle state allows programming (voltage, speed, ...)
    fn check_preconditions(&mut self) -> Result<(), NegativeResponseCode>;

    /// Programmed blocks are compatible with each other
    fn check_compatibility(&mut self, _blocks: &LogicalBlockTable, _validity: u32) -> bool {
        true
    }
}

/// Result of CheckProgrammingDependencies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyStatus {
    Valid,
    /// A mandatory block is not valid
    MissingBlock,
    /// Blocks are present but the compatibility check failed
    Incompatible,
}

impl DependencyStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::Valid => 0x00,
            Self::MissingBlock => 0x01,
            Self::Incompatible => 0x02,
        }
    }
}

/// Externally visible progress of a reprogramming attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Unlocked,
    Erased,
    Transferring,
    TransferComplete,
    Verified,
}

#[derive(Debug)]
enum Stage {
    Idle,
    Erased(BlockProgress),
    Transferring(BlockProgress, TransferSession),
    TransferComplete(BlockProgress),
    Verified,
}

/// How a rejected TransferData/RequestTransferExit affects the transfer
enum Rejection {
    /// Transfer session survives
    Keep(FblError),
    /// Transfer session is destroyed
    Abort(FblError),
}

/// Collaborators borrowed for one sequencer operation
pub struct SequencerContext<'a> {
    pub session: &'a mut SessionManager,
    pub supervisor: &'a mut Supervisor,
    pub memory: &'a mut MemoryFacade,
    pub nv: &'a mut Metadata,
}

impl SequencerContext<'_> {
    fn split_memory(&mut self) -> (&mut MemoryFacade, PollContext<'_>) {
        (
            &mut *self.memory,
            PollContext::new(&mut *self.supervisor, &mut *self.session),
        )
    }
}

/// Reprogramming state machine
#[derive(Debug)]
pub struct DownloadSequencer {
    blocks: LogicalBlockTable,
    transfer_config: TransferConfig,
    erase_config: EraseConfig,
    processors: ProcessorRegistry,
    stage: Stage,
    fingerprint: Option<Fingerprint>,
    results: BTreeMap<u16, u8>,
}

impl DownloadSequencer {
    pub fn new(
        blocks: LogicalBlockTable,
        transfer_config: TransferConfig,
        erase_config: EraseConfig,
        processors: ProcessorRegistry,
    ) -> Self {
        Self {
            blocks,
            transfer_config,
            erase_config,
            processors,
            stage: Stage::Idle,
            fingerprint: None,
            results: BTreeMap::new(),
        }
    }

    pub fn blocks(&self) -> &LogicalBlockTable {
        &self.blocks
    }

    pub fn phase(&self, session: &SessionManager) -> Phase {
        match self.stage {
            Stage::Idle if session.check(Flag::SecurityUnlocked) => Phase::Unlocked,
            Stage::Idle => Phase::Idle,
            Stage::Erased(_) => Phase::Erased,
            Stage::Transferring(..) => Phase::Transferring,
            Stage::TransferComplete(_) => Phase::TransferComplete,
            Stage::Verified => Phase::Verified,
        }
    }

    /// Active transfer segment, if any
    pub fn transfer(&self) -> Option<&TransferSession> {
        match &self.stage {
            Stage::Transferring(_, transfer) => Some(transfer),
            _ => None,
        }
    }

    pub fn expected_sequence_counter(&self) -> Option<u8> {
        self.transfer().map(|t| t.sequence.expected())
    }

    /// Status byte of the last run of a routine
    pub fn routine_result(&self, routine: u16) -> Option<u8> {
        self.results.get(&routine).copied()
    }

    pub fn record_result(&mut self, routine: u16, status: u8) {
        self.results.insert(routine, status);
    }

    /// Stage the fingerprint written into the next verified block
    pub fn stage_fingerprint(&mut self, fingerprint: Fingerprint) {
        self.fingerprint = Some(fingerprint);
    }

    /// Discard all download progress (session downgrade, reset)
    pub fn abort(&mut self, session: &mut SessionManager) {
        if !matches!(self.stage, Stage::Idle) {
            debug!(stage = ?self.phase(session), "Download progress discarded");
        }
        self.stage = Stage::Idle;
        self.fingerprint = None;
        session.clear(Flag::TransferAllowed);
    }

    /// Destroy the active transfer; the block must be erased again
    fn abort_transfer(&mut self, session: &mut SessionManager) {
        warn!("Transfer aborted");
        self.stage = Stage::Idle;
        session.clear(Flag::EraseSucceeded);
    }

    // -------------------------------------------------------------------------
    // Erase
    // -------------------------------------------------------------------------

    /// Erase the logical block containing `range`
    pub fn erase(&mut self, ctx: &mut SequencerContext<'_>, range: MemoryRange) -> FblResult<u8> {
        ctx.session
            .require(Flag::SecurityUnlocked, NegativeResponseCode::SecurityAccessDenied)?;
        if self.erase_config.require_fingerprint && !ctx.session.check(Flag::FingerprintValid) {
            debug!("Erase requested before a fingerprint was written");
            return Err(NegativeResponseCode::ConditionsNotCorrect.into());
        }

        let block = self
            .blocks
            .resolve(range.address, range.length)
            .cloned()
            .ok_or_else(|| {
                debug!(
                    address = format!("0x{:08X}", range.address),
                    length = range.length,
                    "Erase range does not resolve to one logical block"
                );
                NegativeResponseCode::RequestOutOfRange
            })?;

        let attempts = ctx.nv.prog_attempts(block.number)?;
        if block.max_program_attempts != 0 && attempts >= block.max_program_attempts {
            warn!(
                block = block.number,
                attempts, "Programming attempts exhausted"
            );
            return Err(NegativeResponseCode::ConditionsNotCorrect.into());
        }

        self.stage = Stage::Idle;
        ctx.session.clear(Flag::EraseSucceeded);
        ctx.session.clear(Flag::TransferSucceeded);
        ctx.nv.set_block_valid(block.number, false)?;
        ctx.nv.set_appl_valid(false)?;
        ctx.nv
            .set_prog_attempts(block.number, attempts.saturating_add(1))?;

        info!(
            block = block.number,
            start = format!("0x{:08X}", block.start),
            length = block.length,
            "Erasing logical block"
        );
        let (memory, mut poll) = ctx.split_memory();
        if let Err(e) = memory.erase(block.start, block.length, &mut poll) {
            warn!(block = block.number, error = %e, "Erase failed");
            self.record_result(routine_id::ERASE_MEMORY, ROUTINE_FAILED);
            return Err(e.into());
        }

        ctx.session.set(Flag::FlashDriverPresent)?;
        ctx.session.set(Flag::EraseSucceeded)?;
        self.stage = Stage::Erased(BlockProgress::new(
            block.number,
            block.start,
            block.verification,
        ));
        self.record_result(routine_id::ERASE_MEMORY, ROUTINE_OK);
        Ok(ROUTINE_OK)
    }

    // -------------------------------------------------------------------------
    // RequestDownload / TransferData / RequestTransferExit
    // -------------------------------------------------------------------------

    /// Open a transfer segment. Returns the maxNumberOfBlockLength.
    pub fn request_download(
        &mut self,
        ctx: &mut SequencerContext<'_>,
        format: u8,
        range: MemoryRange,
    ) -> FblResult<u16> {
        ctx.session
            .require(Flag::SecurityUnlocked, NegativeResponseCode::SecurityAccessDenied)?;
        ctx.session
            .require(Flag::EraseSucceeded, NegativeResponseCode::RequestSequenceError)?;

        let progress = match &self.stage {
            Stage::Erased(progress) | Stage::TransferComplete(progress) => progress,
            Stage::Transferring(..) => {
                debug!("RequestDownload while a transfer is active");
                return Err(NegativeResponseCode::ConditionsNotCorrect.into());
            }
            Stage::Idle | Stage::Verified => {
                return Err(NegativeResponseCode::RequestSequenceError.into());
            }
        };

        let block = self
            .blocks
            .get(progress.block)
            .ok_or(FatalError::InvariantViolation("erased block missing from table"))?;
        if range.length == 0
            || !block.contains(range.address, range.length)
            || range.address < progress.next_address
        {
            debug!(
                block = block.number,
                address = format!("0x{:08X}", range.address),
                length = range.length,
                next = format!("0x{:08X}", progress.next_address),
                "RequestDownload range rejected"
            );
            return Err(NegativeResponseCode::RequestOutOfRange.into());
        }

        let processor = self.processors.create(format).ok_or_else(|| {
            debug!(format = format!("0x{:02X}", format), "Unsupported data format");
            NegativeResponseCode::RequestOutOfRange
        })?;

        let progress = match std::mem::replace(&mut self.stage, Stage::Idle) {
            Stage::Erased(progress) | Stage::TransferComplete(progress) => progress,
            _ => return Err(FatalError::InvariantViolation("download stage changed").into()),
        };

        ctx.session.clear(Flag::TransferSucceeded);
        ctx.session.set(Flag::TransferAllowed)?;
        info!(
            block = progress.block,
            address = format!("0x{:08X}", range.address),
            length = range.length,
            format = format!("0x{:02X}", format),
            "Download accepted"
        );
        self.stage = Stage::Transferring(
            progress,
            TransferSession::new(
                range.address,
                range.length,
                self.transfer_config.sequence_retries,
                processor,
            ),
        );
        Ok(self.transfer_config.max_block_length)
    }

    /// Accept one TransferData block
    pub fn transfer_data(
        &mut self,
        ctx: &mut SequencerContext<'_>,
        counter: u8,
        payload: &[u8],
    ) -> FblResult<()> {
        ctx.session
            .require(Flag::SecurityUnlocked, NegativeResponseCode::SecurityAccessDenied)?;
        ctx.session
            .require(Flag::TransferAllowed, NegativeResponseCode::RequestSequenceError)?;

        let retries = self.transfer_config.sequence_retries;
        let Stage::Transferring(progress, transfer) = &mut self.stage else {
            return Err(FatalError::InvariantViolation("transfer allowed without transfer").into());
        };

        let result = Self::accept_block(ctx, progress, transfer, counter, payload, retries);
        match result {
            Ok(()) => Ok(()),
            Err(Rejection::Keep(err)) => Err(err),
            Err(Rejection::Abort(err)) => {
                self.abort_transfer(ctx.session);
                Err(err)
            }
        }
    }

    fn accept_block(
        ctx: &mut SequencerContext<'_>,
        progress: &mut BlockProgress,
        transfer: &mut TransferSession,
        counter: u8,
        payload: &[u8],
        retries: u8,
    ) -> Result<(), Rejection> {
        let expected = transfer.sequence.expected();
        if counter != expected {
            if transfer.retry_count == 0 {
                warn!(expected, received = counter, "Sequence retry budget exhausted");
                return Err(Rejection::Abort(
                    NegativeResponseCode::TransferDataSuspended.into(),
                ));
            }
            transfer.retry_count -= 1;
            debug!(
                expected,
                received = counter,
                retries_left = transfer.retry_count,
                "TransferData: wrong block sequence counter"
            );
            return Err(Rejection::Keep(
                NegativeResponseCode::WrongBlockSequenceCounter.into(),
            ));
        }

        let mut output = Vec::with_capacity(payload.len());
        transfer
            .processor
            .process(payload, &mut output)
            .map_err(|e| {
                warn!(error = %e, "Data processing failed");
                Rejection::Abort(e.into())
            })?;
        Self::emit(ctx, progress, transfer, &output)?;

        transfer.sequence.advance();
        transfer.retry_count = retries;
        Ok(())
    }

    /// Write processed bytes at the transfer cursor
    fn emit(
        ctx: &mut SequencerContext<'_>,
        progress: &mut BlockProgress,
        transfer: &mut TransferSession,
        output: &[u8],
    ) -> Result<(), Rejection> {
        if output.is_empty() {
            return Ok(());
        }
        let length = output.len() as u32;
        if length > transfer.bytes_remaining {
            warn!(
                length,
                remaining = transfer.bytes_remaining,
                "TransferData exceeds requested download size"
            );
            return Err(Rejection::Abort(
                NegativeResponseCode::TransferDataSuspended.into(),
            ));
        }

        let (memory, mut poll) = ctx.split_memory();
        memory
            .write(transfer.current_address, output, &mut poll)
            .map_err(|e| {
                warn!(error = %e, "Write failed");
                Rejection::Abort(e.into())
            })?;

        progress.record(transfer.current_address, output);
        transfer.current_address += length;
        transfer.bytes_remaining -= length;
        Ok(())
    }

    /// Close the active transfer segment
    pub fn transfer_exit(&mut self, ctx: &mut SequencerContext<'_>) -> FblResult<()> {
        let Stage::Transferring(progress, transfer) = &mut self.stage else {
            return Err(NegativeResponseCode::RequestSequenceError.into());
        };

        let result = Self::finish_segment(ctx, progress, transfer);
        match result {
            Ok(()) => {}
            Err(Rejection::Keep(err)) => return Err(err),
            Err(Rejection::Abort(err)) => {
                self.abort_transfer(ctx.session);
                return Err(err);
            }
        }

        let Stage::Transferring(mut progress, transfer) =
            std::mem::replace(&mut self.stage, Stage::Idle)
        else {
            return Err(FatalError::InvariantViolation("download stage changed").into());
        };
        progress.next_address = transfer.current_address;

        ctx.session.clear(Flag::TransferAllowed);
        ctx.session.set(Flag::TransferSucceeded)?;
        info!(
            block = progress.block,
            written = progress.written,
            "Transfer complete"
        );
        self.stage = Stage::TransferComplete(progress);
        Ok(())
    }

    fn finish_segment(
        ctx: &mut SequencerContext<'_>,
        progress: &mut BlockProgress,
        transfer: &mut TransferSession,
    ) -> Result<(), Rejection> {
        let mut output = Vec::new();
        transfer.processor.flush(&mut output).map_err(|e| {
            warn!(error = %e, "Data processing flush failed");
            Rejection::Abort(e.into())
        })?;
        Self::emit(ctx, progress, transfer, &output)?;

        if transfer.bytes_remaining != 0 {
            debug!(
                remaining = transfer.bytes_remaining,
                "RequestTransferExit before all data was received"
            );
            return Err(Rejection::Keep(
                NegativeResponseCode::RequestSequenceError.into(),
            ));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Verification and dependencies
    // -------------------------------------------------------------------------

    /// Compare the accumulated checksum against `expected` and persist the
    /// block's metadata on success. Returns the routine status byte.
    pub fn check_memory(
        &mut self,
        ctx: &mut SequencerContext<'_>,
        module: &mut dyn SecurityModule,
        expected: &[u8],
    ) -> FblResult<u8> {
        ctx.session
            .require(Flag::TransferSucceeded, NegativeResponseCode::RequestSequenceError)?;
        let Stage::TransferComplete(progress) = &self.stage else {
            return Err(NegativeResponseCode::RequestSequenceError.into());
        };

        let block = self
            .blocks
            .get(progress.block)
            .cloned()
            .ok_or(FatalError::InvariantViolation("programmed block missing from table"))?;
        let length_ok = match block.verification {
            VerificationMode::Crc32 => expected.len() == 4,
            VerificationMode::Sha256 => expected.len() == 32,
            VerificationMode::Signature => !expected.is_empty(),
        };
        if !length_ok {
            return Err(NegativeResponseCode::IncorrectMessageLengthOrFormat.into());
        }

        let Stage::TransferComplete(progress) = std::mem::replace(&mut self.stage, Stage::Idle)
        else {
            return Err(FatalError::InvariantViolation("download stage changed").into());
        };
        let start = progress.first_address.unwrap_or(block.start);
        let written = progress.written;
        let digest = progress.accumulator.finalize();

        let verified = match block.verification {
            VerificationMode::Crc32 | VerificationMode::Sha256 => digest == expected,
            VerificationMode::Signature => module.verify(&digest, expected),
        };

        if !verified {
            warn!(
                block = block.number,
                computed = %hex::encode(&digest),
                expected = %hex::encode(expected),
                "Verification failed"
            );
            ctx.session.clear(Flag::EraseSucceeded);
            ctx.session.clear(Flag::TransferSucceeded);
            self.record_result(routine_id::CHECK_MEMORY, ROUTINE_FAILED);
            return Ok(ROUTINE_FAILED);
        }

        ctx.session.set(Flag::ChecksumAllowed)?;
        if let (Some(fingerprint), true) =
            (self.fingerprint, ctx.session.check(Flag::FingerprintValid))
        {
            ctx.nv.set_fingerprint(block.number, &fingerprint)?;
        }
        let counter = ctx.nv.prog_counter(block.number)?;
        ctx.nv
            .set_prog_counter(block.number, counter.saturating_add(1))?;
        let mut value = [0u8; 4];
        value.copy_from_slice(&digest[..4]);
        ctx.nv
            .set_crc_record(block.number, u32::from_be_bytes(value), start, written)?;
        ctx.nv.set_block_valid(block.number, true)?;

        ctx.session.clear(Flag::EraseSucceeded);
        self.stage = Stage::Verified;
        self.record_result(routine_id::CHECK_MEMORY, ROUTINE_OK);
        info!(block = block.number, written, "Block verified");
        Ok(ROUTINE_OK)
    }

    /// Evaluate whether the programmed blocks form a startable application
    /// and persist the result as the application-validity flag
    pub fn check_dependencies(
        &mut self,
        nv: &mut Metadata,
        conditions: &mut dyn ProgrammingConditions,
        policy: DependencyPolicy,
    ) -> FblResult<DependencyStatus> {
        let validity = nv.validity()?;
        let mandatory = self.blocks.mandatory_mask();
        let blocks_ok = validity & mandatory == mandatory;

        let status = match policy {
            DependencyPolicy::BlocksOnly => {
                if blocks_ok {
                    DependencyStatus::Valid
                } else {
                    DependencyStatus::MissingBlock
                }
            }
            DependencyPolicy::RequireBoth => {
                if !blocks_ok {
                    DependencyStatus::MissingBlock
                } else if !conditions.check_compatibility(&self.blocks, validity) {
                    DependencyStatus::Incompatible
                } else {
                    DependencyStatus::Valid
                }
            }
            DependencyPolicy::CompatibilityFirst => {
                if conditions.check_compatibility(&self.blocks, validity) {
                    DependencyStatus::Valid
                } else {
                    DependencyStatus::Incompatible
                }
            }
        };

        nv.set_appl_valid(status == DependencyStatus::Valid)?;
        self.record_result(routine_id::CHECK_PROGRAMMING_DEPENDENCIES, status.code());
        info!(
            validity = format!("0x{:08X}", validity),
            mandatory = format!("0x{:08X}", mandatory),
            ?status,
            "Programming dependencies checked"
        );
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FblConfig, SessionConfig, TimingConfig};
    use crate::mock::{ManualClock, RamFlash, RamMetadataStore, RecordingTransport, XorSecurity};
    use crate::session::SessionState;

    struct Fixture {
        sequencer: DownloadSequencer,
        session: SessionManager,
        supervisor: Supervisor,
        memory: MemoryFacade,
        nv: Metadata,
        flash: RamFlash,
    }

    impl Fixture {
        fn new() -> Self {
            let config = FblConfig::default();
            let flash = RamFlash::new(0x0001_0000, 0x0001_8000);
            let mut memory = MemoryFacade::new();
            memory.add_device("flash", 0x0001_0000, 0x0001_8000, Box::new(flash.clone()));
            let mut session = SessionManager::new(SessionConfig::default());
            session.enter_session(SessionState::Programming).unwrap();
            session.set(Flag::SecurityUnlocked).unwrap();
            Self {
                sequencer: DownloadSequencer::new(
                    config.block_table().unwrap(),
                    config.transfer.clone(),
                    config.erase.clone(),
                    ProcessorRegistry::default(),
                ),
                session,
                supervisor: Supervisor::new(
                    TimingConfig::default(),
                    Box::new(ManualClock::new()),
                    Box::new(RecordingTransport::new()),
                ),
                memory,
                nv: Metadata::new(Box::new(RamMetadataStore::new())),
                flash,
            }
        }

        fn split(&mut self) -> (&mut DownloadSequencer, SequencerContext<'_>) {
            (
                &mut self.sequencer,
                SequencerContext {
                    session: &mut self.session,
                    supervisor: &mut self.supervisor,
                    memory: &mut self.memory,
                    nv: &mut self.nv,
                },
            )
        }

        fn erase_block0(&mut self) {
            let (seq, mut ctx) = self.split();
            seq.erase(&mut ctx, MemoryRange { address: 0x0001_0000, length: 0x0001_0000 })
                .unwrap();
        }

        fn download(&mut self, address: u32, length: u32) -> FblResult<u16> {
            let (seq, mut ctx) = self.split();
            seq.request_download(&mut ctx, 0x00, MemoryRange { address, length })
        }

        fn transfer(&mut self, counter: u8, payload: &[u8]) -> FblResult<()> {
            let (seq, mut ctx) = self.split();
            seq.transfer_data(&mut ctx, counter, payload)
        }

        fn exit(&mut self) -> FblResult<()> {
            let (seq, mut ctx) = self.split();
            seq.transfer_exit(&mut ctx)
        }
    }

    fn crc32(data: &[u8]) -> Vec<u8> {
        let mut acc = ChecksumAccumulator::new(VerificationMode::Crc32);
        acc.update(data);
        acc.finalize()
    }

    #[test]
    fn test_erase_requires_unlock() {
        let mut f = Fixture::new();
        f.session.clear(Flag::SecurityUnlocked);
        let (seq, mut ctx) = f.split();
        let err = seq
            .erase(&mut ctx, MemoryRange { address: 0x0001_0000, length: 0x100 })
            .unwrap_err();
        assert_eq!(err.nrc(), Some(NegativeResponseCode::SecurityAccessDenied));
    }

    #[test]
    fn test_erase_rejects_range_across_blocks() {
        let mut f = Fixture::new();
        let (seq, mut ctx) = f.split();
        let err = seq
            .erase(&mut ctx, MemoryRange { address: 0x0001_FF00, length: 0x200 })
            .unwrap_err();
        assert_eq!(err.nrc(), Some(NegativeResponseCode::RequestOutOfRange));
    }

    #[test]
    fn test_erase_counts_attempts_and_invalidates_block() {
        let mut f = Fixture::new();
        f.nv.set_block_valid(0, true).unwrap();
        f.nv.set_block_valid(1, true).unwrap();
        f.erase_block0();
        f.erase_block0();

        assert_eq!(f.nv.prog_attempts(0).unwrap(), 2);
        assert!(!f.nv.block_valid(0).unwrap());
        assert!(f.nv.block_valid(1).unwrap());
        assert!(f.session.check(Flag::EraseSucceeded));
        assert!(f.session.check(Flag::FlashDriverPresent));
        assert_eq!(f.sequencer.phase(&f.session), Phase::Erased);
    }

    #[test]
    fn test_erase_failure_reports_routine_status() {
        let mut f = Fixture::new();
        f.flash.fail_erase();
        let (seq, mut ctx) = f.split();
        let err = seq
            .erase(&mut ctx, MemoryRange { address: 0x0001_0000, length: 0x10 })
            .unwrap_err();
        assert_eq!(err.nrc(), Some(NegativeResponseCode::GeneralProgrammingFailure));
        assert_eq!(
            f.sequencer.routine_result(routine_id::ERASE_MEMORY),
            Some(ROUTINE_FAILED)
        );
        assert!(!f.session.check(Flag::EraseSucceeded));
    }

    #[test]
    fn test_download_requires_erase() {
        let mut f = Fixture::new();
        let err = f.download(0x0001_0000, 0x100).unwrap_err();
        assert_eq!(err.nrc(), Some(NegativeResponseCode::RequestSequenceError));
        assert!(f.sequencer.transfer().is_none());
    }

    #[test]
    fn test_download_rejects_unknown_format_and_range() {
        let mut f = Fixture::new();
        f.erase_block0();
        let (seq, mut ctx) = f.split();
        let err = seq
            .request_download(&mut ctx, 0x11, MemoryRange { address: 0x0001_0000, length: 0x10 })
            .unwrap_err();
        assert_eq!(err.nrc(), Some(NegativeResponseCode::RequestOutOfRange));

        // Block 1 was not erased
        let err = f.download(0x0002_0000, 0x10).unwrap_err();
        assert_eq!(err.nrc(), Some(NegativeResponseCode::RequestOutOfRange));
        assert_eq!(f.sequencer.phase(&f.session), Phase::Erased);
    }

    #[test]
    fn test_wrong_counter_then_budget_exhausted() {
        let mut f = Fixture::new();
        f.erase_block0();
        f.download(0x0001_0000, 0x20).unwrap();
        f.transfer(1, &[0xAA; 0x10]).unwrap();

        for _ in 0..2 {
            let err = f.transfer(1, &[0xAA; 0x10]).unwrap_err();
            assert_eq!(err.nrc(), Some(NegativeResponseCode::WrongBlockSequenceCounter));
            assert_eq!(f.sequencer.expected_sequence_counter(), Some(2));
        }

        let err = f.transfer(1, &[0xAA; 0x10]).unwrap_err();
        assert_eq!(err.nrc(), Some(NegativeResponseCode::TransferDataSuspended));
        assert!(f.sequencer.transfer().is_none());
        assert!(!f.session.check(Flag::TransferAllowed));
        assert!(!f.session.check(Flag::EraseSucceeded));
    }

    #[test]
    fn test_retry_budget_resets_after_good_block() {
        let mut f = Fixture::new();
        f.erase_block0();
        f.download(0x0001_0000, 0x30).unwrap();
        f.transfer(1, &[0; 0x10]).unwrap();
        f.transfer(5, &[0; 0x10]).unwrap_err();
        f.transfer(5, &[0; 0x10]).unwrap_err();
        f.transfer(2, &[0; 0x10]).unwrap();
        assert_eq!(f.sequencer.transfer().unwrap().retry_count, 2);
    }

    #[test]
    fn test_overflowing_transfer_is_suspended() {
        let mut f = Fixture::new();
        f.erase_block0();
        f.download(0x0001_0000, 0x10).unwrap();
        let err = f.transfer(1, &[0; 0x11]).unwrap_err();
        assert_eq!(err.nrc(), Some(NegativeResponseCode::TransferDataSuspended));
        assert!(f.sequencer.transfer().is_none());
    }

    #[test]
    fn test_exit_requires_all_bytes() {
        let mut f = Fixture::new();
        f.erase_block0();
        f.download(0x0001_0000, 0x20).unwrap();
        f.transfer(1, &[0; 0x10]).unwrap();
        let err = f.exit().unwrap_err();
        assert_eq!(err.nrc(), Some(NegativeResponseCode::RequestSequenceError));
        // Session survives
        f.transfer(2, &[0; 0x10]).unwrap();
        f.exit().unwrap();
        assert_eq!(f.sequencer.phase(&f.session), Phase::TransferComplete);
        assert!(f.session.check(Flag::TransferSucceeded));
        assert!(!f.session.check(Flag::TransferAllowed));
    }

    #[test]
    fn test_multi_segment_checksum_spans_segments() {
        let mut f = Fixture::new();
        f.erase_block0();
        f.download(0x0001_0000, 0x10).unwrap();
        f.transfer(1, &[0x11; 0x10]).unwrap();
        f.exit().unwrap();

        // A second segment may not start below the first one's end
        let err = f.download(0x0001_0008, 0x10).unwrap_err();
        assert_eq!(err.nrc(), Some(NegativeResponseCode::RequestOutOfRange));

        f.download(0x0001_0100, 0x10).unwrap();
        assert_eq!(f.sequencer.expected_sequence_counter(), Some(1));
        f.transfer(1, &[0x22; 0x10]).unwrap();
        f.exit().unwrap();

        let mut all = vec![0x11; 0x10];
        all.extend_from_slice(&[0x22; 0x10]);
        let expected = crc32(&all);
        let mut module = XorSecurity::new(vec![0x01]);
        let (seq, mut ctx) = f.split();
        let status = seq.check_memory(&mut ctx, &mut module, &expected).unwrap();
        assert_eq!(status, ROUTINE_OK);
        assert_eq!(f.nv.crc_record(0).unwrap().1, 0x0001_0000);
        assert_eq!(f.nv.crc_record(0).unwrap().2, 0x20);
        assert_eq!(f.flash.contents(0x0001_0100, 0x10), vec![0x22; 0x10]);
    }

    #[test]
    fn test_check_memory_failure_leaves_block_invalid() {
        let mut f = Fixture::new();
        f.erase_block0();
        f.download(0x0001_0000, 0x10).unwrap();
        f.transfer(1, &[0x11; 0x10]).unwrap();
        f.exit().unwrap();

        let mut module = XorSecurity::new(vec![0x01]);
        let (seq, mut ctx) = f.split();
        let status = seq
            .check_memory(&mut ctx, &mut module, &[0xDE, 0xAD, 0xBE, 0xEF])
            .unwrap();
        assert_eq!(status, ROUTINE_FAILED);
        assert!(!f.nv.block_valid(0).unwrap());
        assert!(!f.session.check(Flag::ChecksumAllowed));
        assert_eq!(f.sequencer.phase(&f.session), Phase::Unlocked);
    }

    #[test]
    fn test_check_memory_rejects_wrong_expected_length() {
        let mut f = Fixture::new();
        f.erase_block0();
        f.download(0x0001_0000, 0x10).unwrap();
        f.transfer(1, &[0x11; 0x10]).unwrap();
        f.exit().unwrap();

        let mut module = XorSecurity::new(vec![0x01]);
        let (seq, mut ctx) = f.split();
        let err = seq.check_memory(&mut ctx, &mut module, &[0x00; 3]).unwrap_err();
        assert_eq!(
            err.nrc(),
            Some(NegativeResponseCode::IncorrectMessageLengthOrFormat)
        );
        // Still verifiable
        assert_eq!(f.sequencer.phase(&f.session), Phase::TransferComplete);
    }

    struct Compat(bool);

    impl ProgrammingConditions for Compat {
        fn check_preconditions(&mut self) -> Result<(), NegativeResponseCode> {
            Ok(())
        }

        fn check_compatibility(&mut self, _: &LogicalBlockTable, _: u32) -> bool {
            self.0
        }
    }

    #[test]
    fn test_dependency_policies() {
        let mut f = Fixture::new();

        let status = f
            .sequencer
            .check_dependencies(&mut f.nv, &mut Compat(true), DependencyPolicy::RequireBoth)
            .unwrap();
        assert_eq!(status, DependencyStatus::MissingBlock);

        let status = f
            .sequencer
            .check_dependencies(
                &mut f.nv,
                &mut Compat(true),
                DependencyPolicy::CompatibilityFirst,
            )
            .unwrap();
        assert_eq!(status, DependencyStatus::Valid);
        assert!(f.nv.appl_valid().unwrap());

        f.nv.set_block_valid(0, true).unwrap();
        let status = f
            .sequencer
            .check_dependencies(&mut f.nv, &mut Compat(false), DependencyPolicy::RequireBoth)
            .unwrap();
        assert_eq!(status, DependencyStatus::Incompatible);
        assert!(!f.nv.appl_valid().unwrap());

        let status = f
            .sequencer
            .check_dependencies(&mut f.nv, &mut Compat(false), DependencyPolicy::BlocksOnly)
            .unwrap();
        assert_eq!(status, DependencyStatus::Valid);
        assert_eq!(
            f.sequencer
                .routine_result(routine_id::CHECK_PROGRAMMING_DEPENDENCIES),
            Some(0x00)
        );
    }
}
