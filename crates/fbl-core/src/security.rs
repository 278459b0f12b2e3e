//! Security access (seed/key) coordination
//!
//! Seed generation and key comparison are delegated to a [`SecurityModule`];
//! this module tracks the challenge, counts invalid keys and enforces the
//! lockout delay, which survives a reset through the metadata store.

use tracing::{debug, info, warn};

use crate::config::SecurityConfig;
use crate::error::FblResult;
use crate::nvm::Metadata;
use crate::session::{Flag, SessionManager};
use crate::uds::NegativeResponseCode;

/// Seed/key and signature capability
pub trait SecurityModule: Send {
    fn generate_seed(&mut self) -> Vec<u8>;

    fn compare_key(&mut self, key: &[u8], seed: &[u8]) -> bool;

    /// Check `data` against an expected signature or digest
    fn verify(&mut self, data: &[u8], expected: &[u8]) -> bool;
}

/// Volatile challenge state plus the persisted lockout counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityContext {
    pub last_seed: Vec<u8>,
    pub seed_issued: bool,
    pub invalid_attempt_count: u8,
    pub delay_active: bool,
    pub delay_remaining: u32,
}

/// Security access state machine: Locked -> SeedIssued -> Unlocked
#[derive(Debug)]
pub struct SecurityAccess {
    config: SecurityConfig,
    context: SecurityContext,
}

impl SecurityAccess {
    pub fn new(config: SecurityConfig) -> Self {
        Self {
            config,
            context: SecurityContext::default(),
        }
    }

    pub fn context(&self) -> &SecurityContext {
        &self.context
    }

    /// Reload the lockout state persisted before the last reset. An active
    /// delay restarts with its full duration.
    pub fn restore(&mut self, nv: &mut Metadata) -> FblResult<()> {
        self.context.invalid_attempt_count = nv.security_attempts()?;
        if nv.security_delay()? {
            self.context.delay_active = true;
            self.context.delay_remaining = self.config.delay_ms;
            warn!(
                attempts = self.context.invalid_attempt_count,
                delay_ms = self.config.delay_ms,
                "Security lockout restored after reset"
            );
        }
        Ok(())
    }

    /// Issue a seed, or re-issue the one still awaiting its key. Any earlier
    /// unlock is dropped until the matching key arrives.
    pub fn request_seed(
        &mut self,
        session: &mut SessionManager,
        module: &mut dyn SecurityModule,
    ) -> FblResult<Vec<u8>> {
        if self.context.delay_active {
            debug!(
                remaining_ms = self.context.delay_remaining,
                "Seed requested during lockout delay"
            );
            return Err(NegativeResponseCode::RequiredTimeDelayNotExpired.into());
        }

        if !self.context.seed_issued {
            self.context.last_seed = module.generate_seed();
            self.context.seed_issued = true;
        }
        session.clear(Flag::SecurityKeyAllowed);
        session.clear(Flag::SecurityUnlocked);

        debug!(seed = %hex::encode(&self.context.last_seed), "Seed issued");
        Ok(self.context.last_seed.clone())
    }

    /// Check a key against the outstanding seed
    pub fn submit_key(
        &mut self,
        session: &mut SessionManager,
        module: &mut dyn SecurityModule,
        nv: &mut Metadata,
        key: &[u8],
    ) -> FblResult<()> {
        if self.context.delay_active {
            return Err(NegativeResponseCode::RequiredTimeDelayNotExpired.into());
        }
        // Key-allowed is cleared while a seed awaits its key
        if !self.context.seed_issued || session.check(Flag::SecurityKeyAllowed) {
            return Err(NegativeResponseCode::RequestSequenceError.into());
        }

        let accepted = module.compare_key(key, &self.context.last_seed);
        self.context.seed_issued = false;
        self.context.last_seed.clear();
        session.set(Flag::SecurityKeyAllowed)?;

        if accepted {
            session.set(Flag::SecurityUnlocked)?;
            if self.context.invalid_attempt_count != 0 {
                self.context.invalid_attempt_count = 0;
                nv.set_security_attempts(0)?;
            }
            info!("Security access granted");
            return Ok(());
        }

        self.context.invalid_attempt_count = self.context.invalid_attempt_count.saturating_add(1);
        nv.set_security_attempts(self.context.invalid_attempt_count)?;

        if self.context.invalid_attempt_count >= self.config.attempt_threshold {
            self.context.delay_active = true;
            self.context.delay_remaining = self.config.delay_ms;
            nv.set_security_delay(true)?;
            warn!(
                attempts = self.context.invalid_attempt_count,
                delay_ms = self.config.delay_ms,
                "Security access locked out"
            );
            return Err(NegativeResponseCode::ExceededNumberOfAttempts.into());
        }

        debug!(attempts = self.context.invalid_attempt_count, "Invalid key");
        Err(NegativeResponseCode::InvalidKey.into())
    }

    /// Count down the lockout delay
    pub fn tick(&mut self, elapsed_ms: u32, nv: &mut Metadata) -> FblResult<()> {
        if !self.context.delay_active || elapsed_ms == 0 {
            return Ok(());
        }
        self.context.delay_remaining = self.context.delay_remaining.saturating_sub(elapsed_ms);
        if self.context.delay_remaining == 0 {
            self.context.delay_active = false;
            self.context.invalid_attempt_count = 0;
            nv.set_security_delay(false)?;
            nv.set_security_attempts(0)?;
            info!("Security lockout delay expired");
        }
        Ok(())
    }

    /// Drop any outstanding seed and the unlock (session downgrade)
    pub fn lock(&mut self, session: &mut SessionManager) {
        self.context.seed_issued = false;
        self.context.last_seed.clear();
        session.clear(Flag::SecurityUnlocked);
        if let Err(e) = session.set(Flag::SecurityKeyAllowed) {
            warn!(error = %e, "Could not re-enable key submission");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::error::FblError;
    use crate::mock::{RamMetadataStore, XorSecurity};

    struct Fixture {
        access: SecurityAccess,
        session: SessionManager,
        module: XorSecurity,
        nv: Metadata,
        store: RamMetadataStore,
    }

    fn fixture() -> Fixture {
        let store = RamMetadataStore::new();
        Fixture {
            access: SecurityAccess::new(SecurityConfig::default()),
            session: SessionManager::new(SessionConfig::default()),
            module: XorSecurity::new(vec![0x5A]),
            nv: Metadata::new(Box::new(store.clone())),
            store,
        }
    }

    fn nrc(result: FblResult<()>) -> NegativeResponseCode {
        match result {
            Err(FblError::Negative(nrc)) => nrc,
            other => panic!("expected negative response, got {:?}", other),
        }
    }

    #[test]
    fn test_unlock_with_correct_key() {
        let mut f = fixture();
        let seed = f.access.request_seed(&mut f.session, &mut f.module).unwrap();
        assert!(!f.session.check(Flag::SecurityKeyAllowed));

        let key = f.module.key_for(&seed);
        f.access
            .submit_key(&mut f.session, &mut f.module, &mut f.nv, &key)
            .unwrap();
        assert!(f.session.check(Flag::SecurityUnlocked));
        assert!(f.session.check(Flag::SecurityKeyAllowed));
        assert!(!f.access.context().seed_issued);
    }

    #[test]
    fn test_seed_while_unlocked_drops_unlock() {
        let mut f = fixture();
        let seed = f.access.request_seed(&mut f.session, &mut f.module).unwrap();
        let key = f.module.key_for(&seed);
        f.access
            .submit_key(&mut f.session, &mut f.module, &mut f.nv, &key)
            .unwrap();

        let second = f.access.request_seed(&mut f.session, &mut f.module).unwrap();
        assert_ne!(second, vec![0u8; 4]);
        assert!(f.access.context().seed_issued);
        assert!(!f.session.check(Flag::SecurityUnlocked));
        assert!(!f.session.check(Flag::SecurityKeyAllowed));

        let key = f.module.key_for(&second);
        f.access
            .submit_key(&mut f.session, &mut f.module, &mut f.nv, &key)
            .unwrap();
        assert!(f.session.check(Flag::SecurityUnlocked));
    }

    #[test]
    fn test_key_without_seed() {
        let mut f = fixture();
        let result = f
            .access
            .submit_key(&mut f.session, &mut f.module, &mut f.nv, &[0; 4]);
        assert_eq!(nrc(result), NegativeResponseCode::RequestSequenceError);
    }

    #[test]
    fn test_unconsumed_seed_is_reissued() {
        let mut f = fixture();
        let first = f.access.request_seed(&mut f.session, &mut f.module).unwrap();
        let second = f.access.request_seed(&mut f.session, &mut f.module).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_key_rejected_once_seed_is_consumed() {
        let mut f = fixture();
        let seed = f.access.request_seed(&mut f.session, &mut f.module).unwrap();
        let key = f.module.key_for(&seed);
        f.access
            .submit_key(&mut f.session, &mut f.module, &mut f.nv, &key)
            .unwrap();
        let result = f
            .access
            .submit_key(&mut f.session, &mut f.module, &mut f.nv, &key);
        assert_eq!(nrc(result), NegativeResponseCode::RequestSequenceError);
    }

    #[test]
    fn test_lockout_after_threshold() {
        let mut f = fixture();
        for attempt in 1..=3 {
            f.access.request_seed(&mut f.session, &mut f.module).unwrap();
            let result = f
                .access
                .submit_key(&mut f.session, &mut f.module, &mut f.nv, &[0xFF; 4]);
            let expected = if attempt < 3 {
                NegativeResponseCode::InvalidKey
            } else {
                NegativeResponseCode::ExceededNumberOfAttempts
            };
            assert_eq!(nrc(result), expected);
        }

        assert!(f.access.context().delay_active);
        let result = f
            .access
            .request_seed(&mut f.session, &mut f.module)
            .map(|_| ());
        assert_eq!(nrc(result), NegativeResponseCode::RequiredTimeDelayNotExpired);

        // Persisted for the next power cycle
        let mut reopened = Metadata::new(Box::new(f.store.clone()));
        assert!(reopened.security_delay().unwrap());
        assert_eq!(reopened.security_attempts().unwrap(), 3);
    }

    #[test]
    fn test_lockout_survives_reset_and_expires() {
        let mut f = fixture();
        f.nv.set_security_delay(true).unwrap();
        f.nv.set_security_attempts(3).unwrap();

        let mut access = SecurityAccess::new(SecurityConfig::default());
        access.restore(&mut f.nv).unwrap();
        assert!(access.context().delay_active);
        assert_eq!(access.context().delay_remaining, 10_000);

        access.tick(9_999, &mut f.nv).unwrap();
        assert!(access.context().delay_active);
        access.tick(1, &mut f.nv).unwrap();
        assert!(!access.context().delay_active);
        assert!(!f.nv.security_delay().unwrap());
        assert!(access.request_seed(&mut f.session, &mut f.module).is_ok());
    }

    #[test]
    fn test_lock_discards_seed_and_unlock() {
        let mut f = fixture();
        let seed = f.access.request_seed(&mut f.session, &mut f.module).unwrap();
        let key = f.module.key_for(&seed);
        f.access
            .submit_key(&mut f.session, &mut f.module, &mut f.nv, &key)
            .unwrap();

        f.access.lock(&mut f.session);
        assert!(!f.session.check(Flag::SecurityUnlocked));
        assert!(f.session.check(Flag::SecurityKeyAllowed));
    }
}
