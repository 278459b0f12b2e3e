//! Diagnostic dispatcher
//!
//! Looks a request up in [`SERVICE_TABLE`], checks session, sub-function and
//! length, then runs the pre-handler, handler and post-handler in order.
//! Exactly one final response (positive, negative or none) leaves per
//! request; response-pending frames are sent by the supervisor meanwhile.

use tracing::{debug, error};

use crate::bootloader::{Bootloader, Event};
use crate::error::{FblError, FblResult};
use crate::handlers;
use crate::session::{Flag, SessionState};
use crate::uds::{
    negative_response, positive_response, service_id, NegativeResponseCode,
    SUPPRESS_POSITIVE_RESPONSE,
};

use crate::session::SessionState::{Default as Def, Extended as Ext, Programming as Prg};

const ALL: &[SessionState] = &[Def, Ext, Prg];
const NON_DEFAULT: &[SessionState] = &[Ext, Prg];
const PROGRAMMING: &[SessionState] = &[Prg];

/// A decoded request as seen by handlers
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    pub service_id: u8,
    /// Sub-function with the suppress bit masked off
    pub sub_function: Option<u8>,
    /// Complete request, service id included
    pub data: &'a [u8],
}

/// Handler result on success
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Positive response payload following the response SID
    Positive(Vec<u8>),
    /// The response is sent after the upcoming reset
    Deferred,
}

/// Sub-function accepted by a service
#[derive(Debug)]
pub struct SubFunctionEntry {
    pub id: u8,
    pub sessions: &'static [SessionState],
}

/// Main handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    SessionControl,
    EcuReset,
    ReadDataById,
    SecurityAccess,
    CommunicationControl,
    WriteDataById,
    RoutineControl,
    RequestDownload,
    TransferData,
    RequestTransferExit,
    TesterPresent,
    ControlDtcSetting,
}

/// Checks run before the main handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreHandler {
    /// Vehicle conditions must allow entering the programming session
    ProgrammingConditions,
}

/// Actions run after a successful main handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostHandler {
    /// Schedule a reset when the programming session was left
    ResetAfterSessionExit,
    /// Shut down memory and schedule the requested reset
    EcuReset,
}

/// One row of the service table
#[derive(Debug)]
pub struct ServiceEntry {
    pub service_id: u8,
    pub sessions: &'static [SessionState],
    pub sub_functions: Option<&'static [SubFunctionEntry]>,
    /// Minimum request length including the service id
    pub min_len: usize,
    /// Handler may take long enough to need response-pending frames
    pub response_pending: bool,
    pub pre: Option<PreHandler>,
    pub handler: Handler,
    pub post: Option<PostHandler>,
}

macro_rules! sub {
    ($id:expr, $sessions:expr) => {
        SubFunctionEntry {
            id: $id,
            sessions: $sessions,
        }
    };
}

/// Services offered by the bootloader, sorted by service id
pub static SERVICE_TABLE: &[ServiceEntry] = &[
    ServiceEntry {
        service_id: service_id::DIAGNOSTIC_SESSION_CONTROL,
        sessions: ALL,
        sub_functions: Some(&[sub!(0x01, ALL), sub!(0x02, ALL), sub!(0x03, ALL)]),
        min_len: 2,
        response_pending: false,
        pre: Some(PreHandler::ProgrammingConditions),
        handler: Handler::SessionControl,
        post: Some(PostHandler::ResetAfterSessionExit),
    },
    ServiceEntry {
        service_id: service_id::ECU_RESET,
        sessions: ALL,
        sub_functions: Some(&[sub!(0x01, ALL), sub!(0x03, ALL)]),
        min_len: 2,
        response_pending: false,
        pre: None,
        handler: Handler::EcuReset,
        post: Some(PostHandler::EcuReset),
    },
    ServiceEntry {
        service_id: service_id::READ_DATA_BY_ID,
        sessions: ALL,
        sub_functions: None,
        min_len: 3,
        response_pending: false,
        pre: None,
        handler: Handler::ReadDataById,
        post: None,
    },
    ServiceEntry {
        service_id: service_id::SECURITY_ACCESS,
        sessions: PROGRAMMING,
        sub_functions: Some(&[sub!(0x01, PROGRAMMING), sub!(0x02, PROGRAMMING)]),
        min_len: 2,
        response_pending: false,
        pre: None,
        handler: Handler::SecurityAccess,
        post: None,
    },
    ServiceEntry {
        service_id: service_id::COMMUNICATION_CONTROL,
        sessions: NON_DEFAULT,
        sub_functions: Some(&[
            sub!(0x00, NON_DEFAULT),
            sub!(0x01, NON_DEFAULT),
            sub!(0x02, NON_DEFAULT),
            sub!(0x03, NON_DEFAULT),
        ]),
        min_len: 3,
        response_pending: false,
        pre: None,
        handler: Handler::CommunicationControl,
        post: None,
    },
    ServiceEntry {
        service_id: service_id::WRITE_DATA_BY_ID,
        sessions: PROGRAMMING,
        sub_functions: None,
        min_len: 4,
        response_pending: true,
        pre: None,
        handler: Handler::WriteDataById,
        post: None,
    },
    ServiceEntry {
        service_id: service_id::ROUTINE_CONTROL,
        sessions: NON_DEFAULT,
        sub_functions: Some(&[sub!(0x01, NON_DEFAULT), sub!(0x03, NON_DEFAULT)]),
        min_len: 4,
        response_pending: true,
        pre: None,
        handler: Handler::RoutineControl,
        post: None,
    },
    ServiceEntry {
        service_id: service_id::REQUEST_DOWNLOAD,
        sessions: PROGRAMMING,
        sub_functions: None,
        min_len: 3,
        response_pending: true,
        pre: None,
        handler: Handler::RequestDownload,
        post: None,
    },
    ServiceEntry {
        service_id: service_id::TRANSFER_DATA,
        sessions: PROGRAMMING,
        sub_functions: None,
        min_len: 3,
        response_pending: true,
        pre: None,
        handler: Handler::TransferData,
        post: None,
    },
    ServiceEntry {
        service_id: service_id::REQUEST_TRANSFER_EXIT,
        sessions: PROGRAMMING,
        sub_functions: None,
        min_len: 1,
        response_pending: true,
        pre: None,
        handler: Handler::RequestTransferExit,
        post: None,
    },
    ServiceEntry {
        service_id: service_id::TESTER_PRESENT,
        sessions: ALL,
        sub_functions: Some(&[sub!(0x00, ALL)]),
        min_len: 2,
        response_pending: false,
        pre: None,
        handler: Handler::TesterPresent,
        post: None,
    },
    ServiceEntry {
        service_id: service_id::CONTROL_DTC_SETTING,
        sessions: NON_DEFAULT,
        sub_functions: Some(&[sub!(0x01, NON_DEFAULT), sub!(0x02, NON_DEFAULT)]),
        min_len: 2,
        response_pending: false,
        pre: None,
        handler: Handler::ControlDtcSetting,
        post: None,
    },
];

/// Find the table entry for a service id
pub fn lookup(service_id: u8) -> Option<&'static ServiceEntry> {
    SERVICE_TABLE
        .binary_search_by_key(&service_id, |entry| entry.service_id)
        .ok()
        .map(|index| &SERVICE_TABLE[index])
}

impl Handler {
    fn run(self, bl: &mut Bootloader, req: &Request<'_>) -> FblResult<Reply> {
        match self {
            Self::SessionControl => handlers::session_control(bl, req),
            Self::EcuReset => handlers::ecu_reset(bl, req),
            Self::ReadDataById => handlers::read_data_by_id(bl, req),
            Self::SecurityAccess => handlers::security_access(bl, req),
            Self::CommunicationControl => handlers::communication_control(bl, req),
            Self::WriteDataById => handlers::write_data_by_id(bl, req),
            Self::RoutineControl => handlers::routine_control(bl, req),
            Self::RequestDownload => handlers::request_download(bl, req),
            Self::TransferData => handlers::transfer_data(bl, req),
            Self::RequestTransferExit => handlers::request_transfer_exit(bl, req),
            Self::TesterPresent => handlers::tester_present(bl, req),
            Self::ControlDtcSetting => handlers::control_dtc_setting(bl, req),
        }
    }
}

impl PreHandler {
    fn run(self, bl: &mut Bootloader, req: &Request<'_>) -> FblResult<()> {
        match self {
            Self::ProgrammingConditions => handlers::check_programming_conditions(bl, req),
        }
    }
}

impl PostHandler {
    fn run(self, bl: &mut Bootloader, req: &Request<'_>) -> FblResult<()> {
        match self {
            Self::ResetAfterSessionExit => handlers::reset_after_session_exit(bl, req),
            Self::EcuReset => handlers::schedule_ecu_reset(bl, req),
        }
    }
}

/// Flags that live for the duration of one request
const TRANSIENT_FLAGS: [Flag; 5] = [
    Flag::BufferLocked,
    Flag::ServiceInProgress,
    Flag::SuppressPositiveResponse,
    Flag::ResponsePendingAllowed,
    Flag::ResponsePendingInProgress,
];

impl Bootloader {
    /// Process one complete request from the transport
    pub fn on_request(&mut self, request: &[u8]) {
        if self.halted {
            debug!("Request ignored, bootloader halted");
            return;
        }
        let Some(&sid) = request.first() else {
            return;
        };

        if self.session.check(Flag::BufferLocked) {
            self.supervisor
                .send_response(&negative_response(sid, NegativeResponseCode::BusyRepeatRequest));
            return;
        }

        debug!(
            sid = format!("0x{:02X}", sid),
            request = %hex::encode(request),
            "Received UDS request"
        );
        self.supervisor.restart_session_timers();
        self.supervisor.begin_service(sid);

        let result = self.lock_buffer().and_then(|()| self.process(sid, request));
        match result {
            Ok(Some(response)) => {
                debug!(response = %hex::encode(&response), "Sending UDS response");
                self.supervisor.send_response(&response);
            }
            Ok(None) => {}
            Err(FblError::Negative(nrc)) => {
                debug!(
                    sid = format!("0x{:02X}", sid),
                    nrc = format!("0x{:02X}", u8::from(nrc)),
                    "Negative response: {}",
                    nrc
                );
                self.supervisor.send_response(&negative_response(sid, nrc));
            }
            Err(FblError::Fatal(err)) => {
                self.halt(sid, &FblError::Fatal(err));
                return;
            }
        }

        self.supervisor.end_service();
        for flag in TRANSIENT_FLAGS {
            self.session.clear(flag);
        }
        self.transition = None;

        if let Err(err) = self.session.verify_invariants() {
            self.halt(sid, &err);
        }
    }

    fn lock_buffer(&mut self) -> FblResult<()> {
        self.session.set(Flag::BufferLocked)?;
        self.session.set(Flag::ServiceInProgress)
    }

    /// Run the pipeline for one request; `None` means no response is sent
    fn process(&mut self, sid: u8, request: &[u8]) -> FblResult<Option<Vec<u8>>> {
        let entry = lookup(sid).ok_or(NegativeResponseCode::ServiceNotSupported)?;
        let session = self.session.state();
        if !entry.sessions.contains(&session) {
            return Err(NegativeResponseCode::ServiceNotSupportedInActiveSession.into());
        }

        let mut sub_function = None;
        if let Some(sub_functions) = entry.sub_functions {
            let raw = *request
                .get(1)
                .ok_or(NegativeResponseCode::IncorrectMessageLengthOrFormat)?;
            let id = raw & !SUPPRESS_POSITIVE_RESPONSE;
            let sub = sub_functions
                .iter()
                .find(|sub| sub.id == id)
                .ok_or(NegativeResponseCode::SubFunctionNotSupported)?;
            if !sub.sessions.contains(&session) {
                return Err(NegativeResponseCode::SubFunctionNotSupportedInActiveSession.into());
            }
            if raw & SUPPRESS_POSITIVE_RESPONSE != 0 {
                self.session.set(Flag::SuppressPositiveResponse)?;
            }
            sub_function = Some(id);
        }

        if request.len() < entry.min_len {
            return Err(NegativeResponseCode::IncorrectMessageLengthOrFormat.into());
        }
        if entry.response_pending {
            self.session.set(Flag::ResponsePendingAllowed)?;
        }

        let req = Request {
            service_id: sid,
            sub_function,
            data: request,
        };
        if let Some(pre) = entry.pre {
            pre.run(self, &req)?;
        }
        let reply = entry.handler.run(self, &req)?;
        if let Some(post) = entry.post {
            post.run(self, &req)?;
        }

        match reply {
            Reply::Positive(payload) => {
                // A response-pending frame commits us to a final response
                if self.session.check(Flag::SuppressPositiveResponse)
                    && !self.session.check(Flag::ResponsePendingInProgress)
                {
                    debug!(sid = format!("0x{:02X}", sid), "Positive response suppressed");
                    return Ok(None);
                }
                Ok(Some(positive_response(sid, &payload)))
            }
            Reply::Deferred => Ok(None),
        }
    }

    fn halt(&mut self, sid: u8, err: &FblError) {
        error!(
            sid = format!("0x{:02X}", sid),
            error = %err,
            "Fatal error, halting"
        );
        self.supervisor.halt();
        self.halted = true;
        self.events.push_back(Event::Halted);
    }
}
