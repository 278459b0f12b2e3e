//! Diagnostic session and protocol state
//!
//! [`SessionManager`] owns the active session and the named protocol flags.
//! Every other component asks it what is currently legal.

mod manager;

pub use manager::{SessionManager, SessionTransition};

use crate::uds::session_type;

/// UDS session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// Default session (0x01)
    #[default]
    Default,
    /// Extended diagnostic session (0x03)
    Extended,
    /// Programming session (0x02)
    Programming,
}

impl SessionState {
    pub fn from_sub_function(sub_function: u8) -> Option<Self> {
        match sub_function {
            session_type::DEFAULT => Some(Self::Default),
            session_type::EXTENDED => Some(Self::Extended),
            session_type::PROGRAMMING => Some(Self::Programming),
            _ => None,
        }
    }

    pub fn sub_function(self) -> u8 {
        match self {
            Self::Default => session_type::DEFAULT,
            Self::Extended => session_type::EXTENDED,
            Self::Programming => session_type::PROGRAMMING,
        }
    }
}

/// Named protocol flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    BufferLocked,
    ResponsePendingAllowed,
    ResponsePendingInProgress,
    SuppressPositiveResponse,
    ServiceInProgress,
    SecurityKeyAllowed,
    SecurityUnlocked,
    FingerprintValid,
    EraseSucceeded,
    TransferAllowed,
    TransferSucceeded,
    ChecksumAllowed,
    FlashDriverPresent,
    PreconditionsChecked,
}

/// Snapshot of all protocol flags.
///
/// Fields are read-only outside this module; mutation goes through
/// [`SessionManager::set`] and [`SessionManager::clear`], which keep the
/// cross-flag invariants intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolFlags {
    buffer_locked: bool,
    response_pending_allowed: bool,
    response_pending_in_progress: bool,
    suppress_positive_response: bool,
    service_in_progress: bool,
    security_key_allowed: bool,
    security_unlocked: bool,
    fingerprint_valid: bool,
    erase_succeeded: bool,
    transfer_allowed: bool,
    transfer_succeeded: bool,
    checksum_allowed: bool,
    flash_driver_present: bool,
    preconditions_checked: bool,
}

impl Default for ProtocolFlags {
    fn default() -> Self {
        Self {
            buffer_locked: false,
            response_pending_allowed: false,
            response_pending_in_progress: false,
            suppress_positive_response: false,
            service_in_progress: false,
            // No seed outstanding at power-up
            security_key_allowed: true,
            security_unlocked: false,
            fingerprint_valid: false,
            erase_succeeded: false,
            transfer_allowed: false,
            transfer_succeeded: false,
            checksum_allowed: false,
            flash_driver_present: false,
            preconditions_checked: false,
        }
    }
}

impl ProtocolFlags {
    pub fn get(&self, flag: Flag) -> bool {
        *self.slot(flag)
    }

    fn slot(&self, flag: Flag) -> &bool {
        match flag {
            Flag::BufferLocked => &self.buffer_locked,
            Flag::ResponsePendingAllowed => &self.response_pending_allowed,
            Flag::ResponsePendingInProgress => &self.response_pending_in_progress,
            Flag::SuppressPositiveResponse => &self.suppress_positive_response,
            Flag::ServiceInProgress => &self.service_in_progress,
            Flag::SecurityKeyAllowed => &self.security_key_allowed,
            Flag::SecurityUnlocked => &self.security_unlocked,
            Flag::FingerprintValid => &self.fingerprint_valid,
            Flag::EraseSucceeded => &self.erase_succeeded,
            Flag::TransferAllowed => &self.transfer_allowed,
            Flag::TransferSucceeded => &self.transfer_succeeded,
            Flag::ChecksumAllowed => &self.checksum_allowed,
            Flag::FlashDriverPresent => &self.flash_driver_present,
            Flag::PreconditionsChecked => &self.preconditions_checked,
        }
    }

    fn slot_mut(&mut self, flag: Flag) -> &mut bool {
        match flag {
            Flag::BufferLocked => &mut self.buffer_locked,
            Flag::ResponsePendingAllowed => &mut self.response_pending_allowed,
            Flag::ResponsePendingInProgress => &mut self.response_pending_in_progress,
            Flag::SuppressPositiveResponse => &mut self.suppress_positive_response,
            Flag::ServiceInProgress => &mut self.service_in_progress,
            Flag::SecurityKeyAllowed => &mut self.security_key_allowed,
            Flag::SecurityUnlocked => &mut self.security_unlocked,
            Flag::FingerprintValid => &mut self.fingerprint_valid,
            Flag::EraseSucceeded => &mut self.erase_succeeded,
            Flag::TransferAllowed => &mut self.transfer_allowed,
            Flag::TransferSucceeded => &mut self.transfer_succeeded,
            Flag::ChecksumAllowed => &mut self.checksum_allowed,
            Flag::FlashDriverPresent => &mut self.flash_driver_present,
            Flag::PreconditionsChecked => &mut self.preconditions_checked,
        }
    }

    /// First violated cross-flag invariant, if any.
    pub fn violation(&self) -> Option<&'static str> {
        if self.erase_succeeded && !self.flash_driver_present {
            return Some("erase succeeded without a flash driver");
        }
        if self.transfer_allowed && !(self.erase_succeeded && self.security_unlocked) {
            return Some("transfer allowed without erase and unlock");
        }
        if self.checksum_allowed && !self.transfer_succeeded {
            return Some("checksum allowed without completed transfer");
        }
        None
    }
}
