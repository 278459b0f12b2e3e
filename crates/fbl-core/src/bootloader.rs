//! Bootloader: owns every component and drives the main loop
//!
//! The embedding firmware (or the simulator) constructs a [`Bootloader`]
//! from its [`Drivers`], calls [`Bootloader::start`] once, then alternates
//! [`Bootloader::on_request`] for each received request with
//! [`Bootloader::poll`] and acts on the returned [`Event`]s.

use std::collections::VecDeque;

use tracing::{info, warn};

use crate::config::{ConfigError, FblConfig};
use crate::download::{
    DownloadSequencer, Phase, ProcessorRegistry, ProgrammingConditions, SequencerContext,
};
use crate::error::FblResult;
use crate::handlers::session_parameters;
use crate::memory::MemoryFacade;
use crate::nvm::{Metadata, MetadataStore};
use crate::security::{SecurityAccess, SecurityContext, SecurityModule};
use crate::session::{Flag, SessionManager, SessionState, SessionTransition};
use crate::timer::{Supervisor, Transport, Watchdog};
use crate::uds::{positive_response, service_id, session_type};

/// Reset flavours requested by ECUReset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    Hard,
    Soft,
}

impl ResetKind {
    pub fn sub_function(self) -> u8 {
        match self {
            Self::Hard => crate::uds::reset_type::HARD_RESET,
            Self::Soft => crate::uds::reset_type::SOFT_RESET,
        }
    }
}

/// Something the embedding loop has to act upon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// S3 expired and the session fell back to default
    SessionTimeout,
    /// No traffic in the default session for the sleep time
    SleepRequested,
    /// Reset the ECU now; the last response is already out
    ResetRequested(ResetKind),
    /// A fatal error stopped the bootloader; the watchdog will reset it
    Halted,
}

/// What to do after [`Bootloader::start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupDecision {
    StartApplication,
    StayInBootloader,
}

/// Hardware-facing collaborators
pub struct Drivers {
    pub watchdog: Box<dyn Watchdog>,
    pub transport: Box<dyn Transport>,
    pub memory: MemoryFacade,
    pub metadata: Box<dyn MetadataStore>,
    pub security: Box<dyn SecurityModule>,
    pub conditions: Box<dyn ProgrammingConditions>,
    pub processors: ProcessorRegistry,
}

/// The flash bootloader core
pub struct Bootloader {
    pub(crate) config: FblConfig,
    pub(crate) session: SessionManager,
    pub(crate) security: SecurityAccess,
    pub(crate) sequencer: DownloadSequencer,
    pub(crate) supervisor: Supervisor,
    pub(crate) memory: MemoryFacade,
    pub(crate) nv: Metadata,
    pub(crate) security_module: Box<dyn SecurityModule>,
    pub(crate) conditions: Box<dyn ProgrammingConditions>,
    /// Session change made by the request being processed
    pub(crate) transition: Option<SessionTransition>,
    pub(crate) events: VecDeque<Event>,
    pub(crate) halted: bool,
}

impl std::fmt::Debug for Bootloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bootloader")
            .field("session", &self.session)
            .field("sequencer", &self.sequencer)
            .field("supervisor", &self.supervisor)
            .field("halted", &self.halted)
            .finish_non_exhaustive()
    }
}

impl Bootloader {
    pub fn new(config: FblConfig, drivers: Drivers) -> Result<Self, ConfigError> {
        config.validate()?;
        let blocks = config.block_table()?;

        Ok(Self {
            session: SessionManager::new(config.session.clone()),
            security: SecurityAccess::new(config.security.clone()),
            sequencer: DownloadSequencer::new(
                blocks,
                config.transfer.clone(),
                config.erase.clone(),
                drivers.processors,
            ),
            supervisor: Supervisor::new(
                config.timing.clone(),
                drivers.watchdog,
                drivers.transport,
            ),
            memory: drivers.memory,
            nv: Metadata::new(drivers.metadata),
            security_module: drivers.security,
            conditions: drivers.conditions,
            transition: None,
            events: VecDeque::new(),
            halted: false,
            config,
        })
    }

    /// Startup sequencing after power-on or reset
    ///
    /// Restores the security lockout, answers a programming request or an
    /// ECUReset issued before the reset, and decides whether the
    /// application may run.
    pub fn start(&mut self) -> FblResult<StartupDecision> {
        self.security.restore(&mut self.nv)?;

        if self.config.dependency.check_on_startup {
            let policy = self.config.dependency.policy;
            self.sequencer
                .check_dependencies(&mut self.nv, self.conditions.as_mut(), policy)?;
        }

        if self.nv.prog_request()? {
            self.nv.set_prog_request(false)?;
            self.session.force_session(SessionState::Programming);
            self.supervisor.restart_session_timers();
            let payload = session_parameters(self, SessionState::Programming);
            self.supervisor.send_response(&positive_response(
                service_id::DIAGNOSTIC_SESSION_CONTROL,
                &payload,
            ));
            info!(
                session = format!("0x{:02X}", session_type::PROGRAMMING),
                "Programming requested by application"
            );
            return Ok(StartupDecision::StayInBootloader);
        }

        if let Some(reset) = self.nv.reset_response()? {
            self.nv.set_reset_response(None)?;
            self.supervisor
                .send_response(&positive_response(service_id::ECU_RESET, &[reset]));
            info!(
                reset_type = format!("0x{:02X}", reset),
                "Sent ECU reset response owed from before reset"
            );
        }

        if self.nv.appl_valid()? {
            info!("Application valid, leaving bootloader");
            Ok(StartupDecision::StartApplication)
        } else {
            info!("No valid application, staying in bootloader");
            Ok(StartupDecision::StayInBootloader)
        }
    }

    /// Main loop tick: service the watchdog and timers, act on expiries and
    /// hand back the next pending event
    pub fn poll(&mut self) -> Option<Event> {
        if self.halted {
            return self.events.pop_front();
        }

        self.supervisor.poll(&mut self.session);

        let elapsed = self.supervisor.take_elapsed();
        if let Err(e) = self.security.tick(elapsed, &mut self.nv) {
            warn!(error = %e, "Failed to persist security delay state");
        }

        if self.supervisor.take_s3_expired() {
            self.session_timeout();
        }
        if self.supervisor.take_sleep_expired() {
            info!("Sleep timer expired");
            self.events.push_back(Event::SleepRequested);
        }

        self.events.pop_front()
    }

    fn session_timeout(&mut self) {
        let transition = self.session.downgrade();
        self.sequencer.abort(&mut self.session);
        self.security.lock(&mut self.session);
        info!(from = ?transition.from, "S3 timeout, back to default session");
        self.events.push_back(Event::SessionTimeout);

        if transition.left_programming() && self.config.session.reset_on_programming_exit {
            self.schedule_reset(ResetKind::Hard);
        }
    }

    /// Shut down memory devices and queue a reset
    pub(crate) fn schedule_reset(&mut self, kind: ResetKind) {
        self.sequencer.abort(&mut self.session);
        if let Err(e) = self.memory.deinit_all() {
            warn!(error = %e, "Memory deinit before reset failed");
        }
        self.session.clear(Flag::FlashDriverPresent);
        self.events.push_back(Event::ResetRequested(kind));
    }

    /// Split borrows for a download sequencer operation
    pub(crate) fn download_parts(
        &mut self,
    ) -> (
        &mut DownloadSequencer,
        SequencerContext<'_>,
        &mut dyn SecurityModule,
    ) {
        (
            &mut self.sequencer,
            SequencerContext {
                session: &mut self.session,
                supervisor: &mut self.supervisor,
                memory: &mut self.memory,
                nv: &mut self.nv,
            },
            self.security_module.as_mut(),
        )
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn config(&self) -> &FblConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn phase(&self) -> Phase {
        self.sequencer.phase(&self.session)
    }

    pub fn sequencer(&self) -> &DownloadSequencer {
        &self.sequencer
    }

    pub fn security(&self) -> &SecurityContext {
        self.security.context()
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn metadata(&mut self) -> &mut Metadata {
        &mut self.nv
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHardware;
    use pretty_assertions::assert_eq;

    fn build(config: FblConfig, hw: &MockHardware) -> Bootloader {
        hw.bootloader(config).unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = FblConfig::default();
        config.security.attempt_threshold = 0;
        let hw = MockHardware::new(&FblConfig::default());
        assert!(matches!(
            Bootloader::new(config, hw.drivers()),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_start_without_application() {
        let config = FblConfig::default();
        let hw = MockHardware::new(&config);
        let mut bl = build(config, &hw);
        assert_eq!(bl.start().unwrap(), StartupDecision::StayInBootloader);
        assert!(hw.transport.frames().is_empty());
    }

    #[test]
    fn test_start_application_when_valid() {
        let config = FblConfig::default();
        let hw = MockHardware::new(&config);
        let mut bl = build(config, &hw);
        bl.metadata().set_appl_valid(true).unwrap();
        assert_eq!(bl.start().unwrap(), StartupDecision::StartApplication);
    }

    #[test]
    fn test_programming_request_enters_programming_session() {
        let config = FblConfig::default();
        let hw = MockHardware::new(&config);
        let mut bl = build(config, &hw);
        bl.metadata().set_appl_valid(true).unwrap();
        bl.metadata().set_prog_request(true).unwrap();

        assert_eq!(bl.start().unwrap(), StartupDecision::StayInBootloader);
        assert_eq!(bl.session().state(), SessionState::Programming);
        assert_eq!(
            hw.transport.responses(),
            vec![vec![0x50, 0x02, 0x00, 0x32, 0x01, 0xF4]]
        );
        assert!(!bl.metadata().prog_request().unwrap());
    }

    #[test]
    fn test_startup_dependency_check_updates_validity() {
        let mut config = FblConfig::default();
        config.dependency.check_on_startup = true;
        let hw = MockHardware::new(&config);
        let mut bl = build(config, &hw);
        // Stale flag from an interrupted programming attempt
        bl.metadata().set_appl_valid(true).unwrap();
        assert_eq!(bl.start().unwrap(), StartupDecision::StayInBootloader);
        assert!(!bl.metadata().appl_valid().unwrap());
    }

    #[test]
    fn test_s3_timeout_downgrades_and_resets() {
        let config = FblConfig::default();
        let hw = MockHardware::new(&config);
        let mut bl = build(config, &hw);
        bl.on_request(&[0x10, 0x02]);
        assert_eq!(bl.session().state(), SessionState::Programming);

        hw.clock.advance(4_999);
        assert_eq!(bl.poll(), None);
        hw.clock.advance(1);
        assert_eq!(bl.poll(), Some(Event::SessionTimeout));
        assert_eq!(bl.poll(), Some(Event::ResetRequested(ResetKind::Hard)));
        assert_eq!(bl.session().state(), SessionState::Default);
        assert!(!bl.session().check(Flag::SecurityUnlocked));
    }

    #[test]
    fn test_tester_present_keeps_session_alive() {
        let config = FblConfig::default();
        let hw = MockHardware::new(&config);
        let mut bl = build(config, &hw);
        bl.on_request(&[0x10, 0x03]);
        for _ in 0..5 {
            hw.clock.advance(4_000);
            assert_eq!(bl.poll(), None);
            bl.on_request(&[0x3E, 0x80]);
        }
        assert_eq!(bl.session().state(), SessionState::Extended);
    }

    #[test]
    fn test_sleep_requested_in_default_session() {
        let mut config = FblConfig::default();
        config.timing.sleep_ms = 2_000;
        let hw = MockHardware::new(&config);
        let mut bl = build(config, &hw);
        hw.clock.advance(2_000);
        assert_eq!(bl.poll(), Some(Event::SleepRequested));
        hw.clock.advance(10_000);
        assert_eq!(bl.poll(), None);
    }
}
