//! Service handlers
//!
//! Each handler receives a request that already passed the dispatcher's
//! session, sub-function and minimum-length checks. Handlers return the
//! positive response payload (without the response SID) or an NRC.

use tracing::{debug, info, warn};

use crate::bootloader::{Bootloader, Event, ResetKind};
use crate::dispatcher::{Reply, Request};
use crate::error::FblResult;
use crate::nvm::{Fingerprint, FINGERPRINT_LEN};
use crate::session::{Flag, SessionState};
use crate::uds::{
    data_id, parse_memory_range, reset_type, routine_id, routine_sub_function,
    security_sub_function, NegativeResponseCode,
};

/// Positive response payload of DiagnosticSessionControl:
/// `session P2(ms) P2*(10 ms)`
pub(crate) fn session_parameters(bl: &Bootloader, session: SessionState) -> Vec<u8> {
    let timing = bl.supervisor.timing();
    let p2 = timing.p2_ms;
    let p2_star = (timing.p2_star_ms / 10).min(u16::MAX as u32) as u16;
    let mut payload = vec![session.sub_function()];
    payload.extend_from_slice(&p2.to_be_bytes());
    payload.extend_from_slice(&p2_star.to_be_bytes());
    payload
}

fn sub_function(req: &Request<'_>) -> FblResult<u8> {
    req.sub_function
        .ok_or_else(|| NegativeResponseCode::IncorrectMessageLengthOrFormat.into())
}

// =============================================================================
// DiagnosticSessionControl (0x10)
// =============================================================================

/// Pre-handler: the vehicle must allow programming before the programming
/// session is entered
pub(crate) fn check_programming_conditions(bl: &mut Bootloader, req: &Request<'_>) -> FblResult<()> {
    let target = sub_function(req)?;
    if target != SessionState::Programming.sub_function()
        || bl.session.state() == SessionState::Programming
    {
        return Ok(());
    }
    bl.conditions.check_preconditions().map_err(|nrc| {
        debug!(nrc = %nrc, "Programming conditions not met");
        nrc.into()
    })
}

pub(crate) fn session_control(bl: &mut Bootloader, req: &Request<'_>) -> FblResult<Reply> {
    let target = SessionState::from_sub_function(sub_function(req)?)
        .ok_or(NegativeResponseCode::SubFunctionNotSupported)?;

    let transition = bl.session.enter_session(target)?;
    if transition.is_downgrade() {
        bl.sequencer.abort(&mut bl.session);
        bl.security.lock(&mut bl.session);
    }
    bl.transition = Some(transition);

    Ok(Reply::Positive(session_parameters(bl, target)))
}

/// Post-handler: leaving the programming session for the default session
/// resets the ECU when configured
pub(crate) fn reset_after_session_exit(bl: &mut Bootloader, _req: &Request<'_>) -> FblResult<()> {
    let Some(transition) = bl.transition else {
        return Ok(());
    };
    if transition.left_programming()
        && transition.to == SessionState::Default
        && bl.config.session.reset_on_programming_exit
    {
        info!("Programming session left, scheduling reset");
        bl.schedule_reset(ResetKind::Hard);
    }
    Ok(())
}

// =============================================================================
// ECUReset (0x11)
// =============================================================================

pub(crate) fn ecu_reset(bl: &mut Bootloader, req: &Request<'_>) -> FblResult<Reply> {
    let kind = sub_function(req)?;
    // The response is owed after the reset unless suppressed
    if !bl.session.check(Flag::SuppressPositiveResponse) {
        bl.nv.set_reset_response(Some(kind))?;
    }
    info!(reset_type = format!("0x{:02X}", kind), "ECU reset requested");
    Ok(Reply::Deferred)
}

pub(crate) fn schedule_ecu_reset(bl: &mut Bootloader, req: &Request<'_>) -> FblResult<()> {
    let kind = match sub_function(req)? {
        reset_type::SOFT_RESET => ResetKind::Soft,
        _ => ResetKind::Hard,
    };
    bl.schedule_reset(kind);
    Ok(())
}

// =============================================================================
// ReadDataByIdentifier (0x22) / WriteDataByIdentifier (0x2E)
// =============================================================================

pub(crate) fn read_data_by_id(bl: &mut Bootloader, req: &Request<'_>) -> FblResult<Reply> {
    let ids = &req.data[1..];
    if ids.len() % 2 != 0 {
        return Err(NegativeResponseCode::IncorrectMessageLengthOrFormat.into());
    }

    let mut payload = Vec::new();
    for id in ids.chunks_exact(2) {
        let did = u16::from_be_bytes([id[0], id[1]]);
        payload.extend_from_slice(id);
        read_data_record(bl, did, &mut payload)?;
    }
    Ok(Reply::Positive(payload))
}

fn read_data_record(bl: &mut Bootloader, did: u16, out: &mut Vec<u8>) -> FblResult<()> {
    match did {
        data_id::BLOCK_FINGERPRINTS => {
            let numbers: Vec<u8> = bl.sequencer.blocks().iter().map(|b| b.number).collect();
            for number in numbers {
                out.extend_from_slice(&bl.nv.fingerprint(number)?);
            }
        }
        data_id::PROGRAMMING_COUNTERS => {
            let numbers: Vec<u8> = bl.sequencer.blocks().iter().map(|b| b.number).collect();
            for number in numbers {
                out.extend_from_slice(&bl.nv.prog_counter(number)?.to_be_bytes());
                out.extend_from_slice(&bl.nv.prog_attempts(number)?.to_be_bytes());
            }
        }
        data_id::ACTIVE_DIAGNOSTIC_SESSION => {
            out.push(bl.session.state().sub_function());
        }
        _ => {
            debug!(did = format!("0x{:04X}", did), "Unsupported data identifier");
            return Err(NegativeResponseCode::RequestOutOfRange.into());
        }
    }
    Ok(())
}

pub(crate) fn write_data_by_id(bl: &mut Bootloader, req: &Request<'_>) -> FblResult<Reply> {
    let did = u16::from_be_bytes([req.data[1], req.data[2]]);
    if did != data_id::FINGERPRINT {
        debug!(did = format!("0x{:04X}", did), "Data identifier not writable");
        return Err(NegativeResponseCode::RequestOutOfRange.into());
    }
    let record = &req.data[3..];
    let fingerprint: Fingerprint = record
        .try_into()
        .map_err(|_| NegativeResponseCode::IncorrectMessageLengthOrFormat)?;
    bl.session
        .require(Flag::SecurityUnlocked, NegativeResponseCode::SecurityAccessDenied)?;

    bl.sequencer.stage_fingerprint(fingerprint);
    bl.session.set(Flag::FingerprintValid)?;
    info!(
        fingerprint = %hex::encode(fingerprint),
        length = FINGERPRINT_LEN,
        "Fingerprint written"
    );
    Ok(Reply::Positive(req.data[1..3].to_vec()))
}

// =============================================================================
// SecurityAccess (0x27)
// =============================================================================

pub(crate) fn security_access(bl: &mut Bootloader, req: &Request<'_>) -> FblResult<Reply> {
    let sub = sub_function(req)?;
    let Bootloader {
        security,
        session,
        security_module,
        nv,
        ..
    } = bl;

    match sub {
        security_sub_function::REQUEST_SEED => {
            let seed = security.request_seed(session, security_module.as_mut())?;
            let mut payload = vec![sub];
            payload.extend_from_slice(&seed);
            Ok(Reply::Positive(payload))
        }
        security_sub_function::SEND_KEY => {
            let key = &req.data[2..];
            if key.is_empty() {
                return Err(NegativeResponseCode::IncorrectMessageLengthOrFormat.into());
            }
            security.submit_key(session, security_module.as_mut(), nv, key)?;
            Ok(Reply::Positive(vec![sub]))
        }
        _ => Err(NegativeResponseCode::SubFunctionNotSupported.into()),
    }
}

// =============================================================================
// CommunicationControl (0x28) / ControlDTCSetting (0x85) / TesterPresent (0x3E)
// =============================================================================

pub(crate) fn communication_control(_bl: &mut Bootloader, req: &Request<'_>) -> FblResult<Reply> {
    let control = sub_function(req)?;
    info!(
        control_type = format!("0x{:02X}", control),
        communication_type = format!("0x{:02X}", req.data[2]),
        "Communication control"
    );
    Ok(Reply::Positive(vec![control]))
}

pub(crate) fn control_dtc_setting(_bl: &mut Bootloader, req: &Request<'_>) -> FblResult<Reply> {
    let setting = sub_function(req)?;
    debug!(setting = format!("0x{:02X}", setting), "DTC setting");
    Ok(Reply::Positive(vec![setting]))
}

pub(crate) fn tester_present(_bl: &mut Bootloader, req: &Request<'_>) -> FblResult<Reply> {
    Ok(Reply::Positive(vec![sub_function(req)?]))
}

// =============================================================================
// RoutineControl (0x31)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Routine {
    EraseMemory,
    CheckMemory,
    CheckProgrammingDependencies,
    CheckProgrammingPreconditions,
}

struct RoutineEntry {
    id: u16,
    sessions: &'static [SessionState],
    routine: Routine,
}

static ROUTINE_TABLE: &[RoutineEntry] = &[
    RoutineEntry {
        id: routine_id::CHECK_MEMORY,
        sessions: &[SessionState::Programming],
        routine: Routine::CheckMemory,
    },
    RoutineEntry {
        id: routine_id::CHECK_PROGRAMMING_PRECONDITIONS,
        sessions: &[SessionState::Extended, SessionState::Programming],
        routine: Routine::CheckProgrammingPreconditions,
    },
    RoutineEntry {
        id: routine_id::ERASE_MEMORY,
        sessions: &[SessionState::Programming],
        routine: Routine::EraseMemory,
    },
    RoutineEntry {
        id: routine_id::CHECK_PROGRAMMING_DEPENDENCIES,
        sessions: &[SessionState::Programming],
        routine: Routine::CheckProgrammingDependencies,
    },
];

pub(crate) fn routine_control(bl: &mut Bootloader, req: &Request<'_>) -> FblResult<Reply> {
    let sub = sub_function(req)?;
    let rid = u16::from_be_bytes([req.data[2], req.data[3]]);
    let session = bl.session.state();
    let entry = ROUTINE_TABLE
        .iter()
        .find(|entry| entry.id == rid && entry.sessions.contains(&session))
        .ok_or_else(|| {
            debug!(
                routine = format!("0x{:04X}", rid),
                ?session,
                "Routine not available"
            );
            NegativeResponseCode::RequestOutOfRange
        })?;

    let status = match sub {
        routine_sub_function::START_ROUTINE => start_routine(bl, entry.routine, &req.data[4..])?,
        routine_sub_function::REQUEST_ROUTINE_RESULTS => bl
            .sequencer
            .routine_result(rid)
            .ok_or(NegativeResponseCode::RequestSequenceError)?,
        _ => return Err(NegativeResponseCode::SubFunctionNotSupported.into()),
    };

    let mut payload = vec![sub];
    payload.extend_from_slice(&rid.to_be_bytes());
    payload.push(status);
    Ok(Reply::Positive(payload))
}

fn start_routine(bl: &mut Bootloader, routine: Routine, params: &[u8]) -> FblResult<u8> {
    match routine {
        Routine::EraseMemory => {
            let (range, consumed) = parse_memory_range(params)?;
            if consumed != params.len() {
                return Err(NegativeResponseCode::IncorrectMessageLengthOrFormat.into());
            }
            let (sequencer, mut ctx, _) = bl.download_parts();
            sequencer.erase(&mut ctx, range)
        }
        Routine::CheckMemory => {
            if params.is_empty() {
                return Err(NegativeResponseCode::IncorrectMessageLengthOrFormat.into());
            }
            let (sequencer, mut ctx, module) = bl.download_parts();
            sequencer.check_memory(&mut ctx, module, params)
        }
        Routine::CheckProgrammingDependencies => {
            let policy = bl.config.dependency.policy;
            let status =
                bl.sequencer
                    .check_dependencies(&mut bl.nv, bl.conditions.as_mut(), policy)?;
            Ok(status.code())
        }
        Routine::CheckProgrammingPreconditions => match bl.conditions.check_preconditions() {
            Ok(()) => {
                bl.session.set(Flag::PreconditionsChecked)?;
                bl.sequencer
                    .record_result(routine_id::CHECK_PROGRAMMING_PRECONDITIONS, 0x00);
                Ok(0x00)
            }
            Err(nrc) => {
                warn!(nrc = %nrc, "Programming preconditions not met");
                bl.sequencer
                    .record_result(routine_id::CHECK_PROGRAMMING_PRECONDITIONS, 0x01);
                Err(nrc.into())
            }
        },
    }
}

// =============================================================================
// RequestDownload (0x34) / TransferData (0x36) / RequestTransferExit (0x37)
// =============================================================================

/// `lengthFormatIdentifier` of the RequestDownload response: two-byte
/// maxNumberOfBlockLength
const LENGTH_FORMAT_IDENTIFIER: u8 = 0x20;

pub(crate) fn request_download(bl: &mut Bootloader, req: &Request<'_>) -> FblResult<Reply> {
    let format = req.data[1];
    let (range, consumed) = parse_memory_range(&req.data[2..])?;
    if 2 + consumed != req.data.len() {
        return Err(NegativeResponseCode::IncorrectMessageLengthOrFormat.into());
    }

    let (sequencer, mut ctx, _) = bl.download_parts();
    let max_block_length = sequencer.request_download(&mut ctx, format, range)?;

    let mut payload = vec![LENGTH_FORMAT_IDENTIFIER];
    payload.extend_from_slice(&max_block_length.to_be_bytes());
    Ok(Reply::Positive(payload))
}

pub(crate) fn transfer_data(bl: &mut Bootloader, req: &Request<'_>) -> FblResult<Reply> {
    // maxNumberOfBlockLength counts the service id and the counter
    if req.data.len() > bl.config.transfer.max_block_length as usize {
        debug!(
            length = req.data.len(),
            max = bl.config.transfer.max_block_length,
            "TransferData longer than negotiated"
        );
        return Err(NegativeResponseCode::IncorrectMessageLengthOrFormat.into());
    }
    let counter = req.data[1];

    let (sequencer, mut ctx, _) = bl.download_parts();
    sequencer.transfer_data(&mut ctx, counter, &req.data[2..])?;
    Ok(Reply::Positive(vec![counter]))
}

pub(crate) fn request_transfer_exit(bl: &mut Bootloader, _req: &Request<'_>) -> FblResult<Reply> {
    let (sequencer, mut ctx, _) = bl.download_parts();
    sequencer.transfer_exit(&mut ctx)?;
    Ok(Reply::Positive(Vec::new()))
}
