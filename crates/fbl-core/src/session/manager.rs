//! Session manager: active session plus protocol flags

use tracing::{debug, info};

use super::{Flag, ProtocolFlags, SessionState};
use crate::config::SessionConfig;
use crate::error::{FatalError, FblError, FblResult};
use crate::uds::NegativeResponseCode;

/// A completed session change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTransition {
    pub from: SessionState,
    pub to: SessionState,
}

impl SessionTransition {
    /// Non-default to default
    pub fn is_downgrade(&self) -> bool {
        self.from != SessionState::Default && self.to == SessionState::Default
    }

    pub fn left_programming(&self) -> bool {
        self.from == SessionState::Programming && self.to != SessionState::Programming
    }
}

/// Owns the active session and all protocol flags
#[derive(Debug)]
pub struct SessionManager {
    config: SessionConfig,
    state: SessionState,
    flags: ProtocolFlags,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Default,
            flags: ProtocolFlags::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn flags(&self) -> &ProtocolFlags {
        &self.flags
    }

    pub fn check(&self, flag: Flag) -> bool {
        self.flags.get(flag)
    }

    /// Fail with `nrc` unless `flag` is set
    pub fn require(&self, flag: Flag, nrc: NegativeResponseCode) -> Result<(), NegativeResponseCode> {
        if self.check(flag) {
            Ok(())
        } else {
            debug!(?flag, nrc = format!("0x{:02X}", nrc), "Precondition flag not set");
            Err(nrc)
        }
    }

    /// Set a flag. Setting a gate whose prerequisites are missing is an
    /// internal error and leaves the flags unchanged.
    pub fn set(&mut self, flag: Flag) -> FblResult<()> {
        let previous = self.flags;
        *self.flags.slot_mut(flag) = true;
        if let Some(violation) = self.flags.violation() {
            self.flags = previous;
            return Err(FblError::Fatal(FatalError::InvariantViolation(violation)));
        }
        Ok(())
    }

    /// Clear a flag and every gate that depended on it
    pub fn clear(&mut self, flag: Flag) {
        *self.flags.slot_mut(flag) = false;
        match flag {
            Flag::FlashDriverPresent => {
                self.flags.erase_succeeded = false;
                self.flags.transfer_allowed = false;
            }
            Flag::SecurityUnlocked | Flag::EraseSucceeded => {
                self.flags.transfer_allowed = false;
            }
            Flag::TransferSucceeded => {
                self.flags.checksum_allowed = false;
            }
            _ => {}
        }
    }

    /// Check the cross-flag invariants
    pub fn verify_invariants(&self) -> FblResult<()> {
        match self.flags.violation() {
            Some(violation) => Err(FatalError::InvariantViolation(violation).into()),
            None => Ok(()),
        }
    }

    /// Validate and perform a DiagnosticSessionControl transition.
    ///
    /// A downgrade clears the download gates and security unlock; the caller
    /// discards transfer state and locks the security module.
    pub fn enter_session(
        &mut self,
        target: SessionState,
    ) -> Result<SessionTransition, NegativeResponseCode> {
        let from = self.state;
        match (from, target) {
            (SessionState::Programming, SessionState::Extended) => {
                return Err(NegativeResponseCode::SubFunctionNotSupportedInActiveSession);
            }
            (SessionState::Default, SessionState::Programming)
                if self.config.require_preconditions_routine
                    && !self.check(Flag::PreconditionsChecked) =>
            {
                debug!("Programming session requested before preconditions were checked");
                return Err(NegativeResponseCode::ConditionsNotCorrect);
            }
            _ => {}
        }

        Ok(self.switch_to(target))
    }

    /// Enter a session without transition checks (startup after a
    /// programming request from the application)
    pub fn force_session(&mut self, target: SessionState) -> SessionTransition {
        self.switch_to(target)
    }

    /// Implicit downgrade to the default session (S3 timeout)
    pub fn downgrade(&mut self) -> SessionTransition {
        self.switch_to(SessionState::Default)
    }

    fn switch_to(&mut self, target: SessionState) -> SessionTransition {
        let transition = SessionTransition {
            from: self.state,
            to: target,
        };

        if transition.is_downgrade() {
            self.clear(Flag::SecurityUnlocked);
            self.clear(Flag::EraseSucceeded);
            self.clear(Flag::TransferSucceeded);
            self.clear(Flag::FingerprintValid);
            self.clear(Flag::PreconditionsChecked);
            self.clear(Flag::FlashDriverPresent);
        }

        if transition.from != transition.to {
            info!(from = ?transition.from, to = ?transition.to, "Session changed");
        }
        self.state = target;
        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        SessionManager::new(SessionConfig::default())
    }

    fn unlock_and_allow_transfer(manager: &mut SessionManager) {
        manager.set(Flag::SecurityUnlocked).unwrap();
        manager.set(Flag::FlashDriverPresent).unwrap();
        manager.set(Flag::EraseSucceeded).unwrap();
        manager.set(Flag::TransferAllowed).unwrap();
    }

    #[test]
    fn test_transfer_gate_requires_erase_and_unlock() {
        let mut manager = manager();
        let err = manager.set(Flag::TransferAllowed).unwrap_err();
        assert!(err.is_fatal());
        assert!(!manager.check(Flag::TransferAllowed));

        manager.set(Flag::SecurityUnlocked).unwrap();
        assert!(manager.set(Flag::TransferAllowed).is_err());
        manager.set(Flag::FlashDriverPresent).unwrap();
        manager.set(Flag::EraseSucceeded).unwrap();
        manager.set(Flag::TransferAllowed).unwrap();
        assert!(manager.check(Flag::TransferAllowed));
    }

    #[test]
    fn test_checksum_gate_requires_transfer() {
        let mut manager = manager();
        assert!(manager.set(Flag::ChecksumAllowed).is_err());
        manager.set(Flag::TransferSucceeded).unwrap();
        manager.set(Flag::ChecksumAllowed).unwrap();

        manager.clear(Flag::TransferSucceeded);
        assert!(!manager.check(Flag::ChecksumAllowed));
        manager.verify_invariants().unwrap();
    }

    #[test]
    fn test_clear_cascades_to_transfer_gate() {
        let mut manager = manager();
        unlock_and_allow_transfer(&mut manager);
        manager.clear(Flag::SecurityUnlocked);
        assert!(!manager.check(Flag::TransferAllowed));

        let mut manager = self::manager();
        unlock_and_allow_transfer(&mut manager);
        manager.clear(Flag::EraseSucceeded);
        assert!(!manager.check(Flag::TransferAllowed));
    }

    #[test]
    fn test_erase_gate_requires_flash_driver() {
        let mut manager = manager();
        assert!(manager.set(Flag::EraseSucceeded).unwrap_err().is_fatal());

        unlock_and_allow_transfer(&mut manager);
        manager.clear(Flag::FlashDriverPresent);
        assert!(!manager.check(Flag::EraseSucceeded));
        assert!(!manager.check(Flag::TransferAllowed));
        manager.verify_invariants().unwrap();
    }

    #[test]
    fn test_downgrade_clears_gates() {
        let mut manager = manager();
        manager.enter_session(SessionState::Programming).unwrap();
        unlock_and_allow_transfer(&mut manager);
        manager.set(Flag::TransferSucceeded).unwrap();
        manager.set(Flag::ChecksumAllowed).unwrap();

        let transition = manager.enter_session(SessionState::Default).unwrap();
        assert!(transition.is_downgrade());
        assert!(transition.left_programming());
        for flag in [
            Flag::TransferAllowed,
            Flag::TransferSucceeded,
            Flag::ChecksumAllowed,
            Flag::SecurityUnlocked,
            Flag::EraseSucceeded,
            Flag::FlashDriverPresent,
        ] {
            assert!(!manager.check(flag), "{:?} still set", flag);
        }
    }

    #[test]
    fn test_programming_to_extended_rejected() {
        let mut manager = manager();
        manager.enter_session(SessionState::Programming).unwrap();
        assert_eq!(
            manager.enter_session(SessionState::Extended),
            Err(NegativeResponseCode::SubFunctionNotSupportedInActiveSession)
        );
        assert_eq!(manager.state(), SessionState::Programming);
    }

    #[test]
    fn test_programming_reentry_keeps_state() {
        let mut manager = manager();
        manager.enter_session(SessionState::Programming).unwrap();
        manager.set(Flag::SecurityUnlocked).unwrap();
        let transition = manager.enter_session(SessionState::Programming).unwrap();
        assert!(!transition.is_downgrade());
        assert!(manager.check(Flag::SecurityUnlocked));
    }

    #[test]
    fn test_programming_requires_preconditions_when_configured() {
        let mut manager = SessionManager::new(SessionConfig {
            require_preconditions_routine: true,
            ..SessionConfig::default()
        });
        assert_eq!(
            manager.enter_session(SessionState::Programming),
            Err(NegativeResponseCode::ConditionsNotCorrect)
        );

        manager.enter_session(SessionState::Extended).unwrap();
        manager.set(Flag::PreconditionsChecked).unwrap();
        manager.enter_session(SessionState::Programming).unwrap();
        assert_eq!(manager.state(), SessionState::Programming);
    }
}
