//! Watchdog and supervisory timers
//!
//! [`Supervisor::poll`] is the single cooperative yield point. It retriggers
//! the hardware watchdog, consumes elapsed milliseconds, counts down the
//! S3, P2/P2* and sleep timers and lets the transport do idle housekeeping.
//! Expiries are latched here and acted upon by the main loop, never from
//! inside a memory operation.

use tracing::{debug, warn};

use crate::config::TimingConfig;
use crate::memory::WatchdogPoll;
use crate::session::{Flag, SessionManager, SessionState};

/// Hardware watchdog and millisecond time base
pub trait Watchdog: Send {
    /// Retrigger the watchdog
    fn trigger(&mut self);

    /// Milliseconds elapsed since the previous call
    fn elapsed_ms(&mut self) -> u32;
}

/// Outgoing side of the transport adapter
pub trait Transport: Send {
    /// Send a complete response buffer
    fn send_response(&mut self, response: &[u8]);

    /// Send `7F sid 78` for the request being processed
    fn send_response_pending(&mut self, service_id: u8);

    /// Idle-time work of the transport layer
    fn housekeeping(&mut self) {}
}

/// Countdown timers in milliseconds; zero means stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisoryTimers {
    pub tester_present_remaining: u32,
    pub response_pending_remaining: u32,
    pub sleep_remaining: u32,
}

/// Watchdog/timer supervisor
pub struct Supervisor {
    config: TimingConfig,
    watchdog: Box<dyn Watchdog>,
    transport: Box<dyn Transport>,
    timers: SupervisoryTimers,
    /// Service currently being processed, owner of the P2 timer
    pending_service: Option<u8>,
    pending_elapsed: u32,
    s3_expired: bool,
    sleep_expired: bool,
    halted: bool,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("timers", &self.timers)
            .field("pending_service", &self.pending_service)
            .field("halted", &self.halted)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    pub fn new(
        config: TimingConfig,
        watchdog: Box<dyn Watchdog>,
        transport: Box<dyn Transport>,
    ) -> Self {
        let mut supervisor = Self {
            config,
            watchdog,
            transport,
            timers: SupervisoryTimers::default(),
            pending_service: None,
            pending_elapsed: 0,
            s3_expired: false,
            sleep_expired: false,
            halted: false,
        };
        supervisor.restart_session_timers();
        supervisor
    }

    pub fn timers(&self) -> SupervisoryTimers {
        self.timers
    }

    pub fn timing(&self) -> &TimingConfig {
        &self.config
    }

    /// Retrigger the watchdog, advance the timers and run transport
    /// housekeeping. Does nothing once halted.
    pub fn poll(&mut self, session: &mut SessionManager) {
        if self.halted {
            return;
        }
        self.watchdog.trigger();
        let elapsed = self.watchdog.elapsed_ms();
        if elapsed > 0 {
            self.tick(elapsed, session);
        }
        self.transport.housekeeping();
    }

    fn tick(&mut self, elapsed: u32, session: &mut SessionManager) {
        self.pending_elapsed = self.pending_elapsed.saturating_add(elapsed);

        // S3 and sleep are stopped while a request is processed
        let idle = self.pending_service.is_none();

        // S3 only runs outside the default session
        if idle
            && session.state() != SessionState::Default
            && self.timers.tester_present_remaining > 0
        {
            self.timers.tester_present_remaining =
                self.timers.tester_present_remaining.saturating_sub(elapsed);
            if self.timers.tester_present_remaining == 0 {
                debug!("S3 timer expired");
                self.s3_expired = true;
            }
        }

        if let Some(service_id) = self.pending_service {
            if self.timers.response_pending_remaining > 0 {
                self.timers.response_pending_remaining =
                    self.timers.response_pending_remaining.saturating_sub(elapsed);
                if self.timers.response_pending_remaining <= self.config.response_pending_margin_ms
                {
                    self.response_pending_due(service_id, session);
                }
            }
        }

        if idle && session.state() == SessionState::Default && self.timers.sleep_remaining > 0 {
            self.timers.sleep_remaining = self.timers.sleep_remaining.saturating_sub(elapsed);
            if self.timers.sleep_remaining == 0 {
                debug!("Sleep timer expired");
                self.sleep_expired = true;
            }
        }
    }

    fn response_pending_due(&mut self, service_id: u8, session: &mut SessionManager) {
        if !session.check(Flag::ResponsePendingAllowed) {
            warn!(
                sid = format!("0x{:02X}", service_id),
                "P2 deadline reached for a service without response pending"
            );
            self.timers.response_pending_remaining = 0;
            return;
        }

        debug!(sid = format!("0x{:02X}", service_id), "Sending response pending");
        self.transport.send_response_pending(service_id);
        if let Err(e) = session.set(Flag::ResponsePendingInProgress) {
            warn!(error = %e, "Could not mark response pending in progress");
        }
        self.timers.response_pending_remaining = self.config.p2_star_ms;
    }

    /// Arm the P2 timer for a request
    pub fn begin_service(&mut self, service_id: u8) {
        self.pending_service = Some(service_id);
        self.timers.response_pending_remaining = self.config.p2_ms as u32;
    }

    /// Stop the P2/P2* timer once the final response is out and restart
    /// the session timers from there
    pub fn end_service(&mut self) {
        self.pending_service = None;
        self.timers.response_pending_remaining = 0;
        self.restart_session_timers();
    }

    /// Reload S3 and the sleep timer
    pub fn restart_session_timers(&mut self) {
        self.timers.tester_present_remaining = self.config.s3_ms;
        self.timers.sleep_remaining = self.config.sleep_ms;
        self.s3_expired = false;
        self.sleep_expired = false;
    }

    /// Milliseconds elapsed since the last call
    pub fn take_elapsed(&mut self) -> u32 {
        std::mem::take(&mut self.pending_elapsed)
    }

    pub fn take_s3_expired(&mut self) -> bool {
        std::mem::take(&mut self.s3_expired)
    }

    pub fn take_sleep_expired(&mut self) -> bool {
        std::mem::take(&mut self.sleep_expired)
    }

    pub fn send_response(&mut self, response: &[u8]) {
        self.transport.send_response(response);
    }

    /// Stop retriggering the watchdog
    pub fn halt(&mut self) {
        self.halted = true;
        self.pending_service = None;
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }
}

/// Poll context passed into memory operations
pub struct PollContext<'a> {
    supervisor: &'a mut Supervisor,
    session: &'a mut SessionManager,
}

impl<'a> PollContext<'a> {
    pub fn new(supervisor: &'a mut Supervisor, session: &'a mut SessionManager) -> Self {
        Self {
            supervisor,
            session,
        }
    }
}

impl WatchdogPoll for PollContext<'_> {
    fn poll(&mut self) {
        self.supervisor.poll(self.session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::mock::{ManualClock, RecordingTransport};

    fn setup(timing: TimingConfig) -> (Supervisor, SessionManager, ManualClock, RecordingTransport) {
        let clock = ManualClock::new();
        let transport = RecordingTransport::new();
        let supervisor = Supervisor::new(
            timing,
            Box::new(clock.clone()),
            Box::new(transport.clone()),
        );
        (
            supervisor,
            SessionManager::new(SessionConfig::default()),
            clock,
            transport,
        )
    }

    #[test]
    fn test_poll_triggers_watchdog() {
        let (mut supervisor, mut session, clock, _) = setup(TimingConfig::default());
        supervisor.poll(&mut session);
        supervisor.poll(&mut session);
        assert_eq!(clock.triggers(), 2);
    }

    #[test]
    fn test_s3_expires_outside_default_session() {
        let (mut supervisor, mut session, clock, _) = setup(TimingConfig::default());

        clock.advance(6000);
        supervisor.poll(&mut session);
        assert!(!supervisor.take_s3_expired());

        session.enter_session(SessionState::Programming).unwrap();
        supervisor.restart_session_timers();
        clock.advance(4999);
        supervisor.poll(&mut session);
        assert!(!supervisor.take_s3_expired());
        clock.advance(1);
        supervisor.poll(&mut session);
        assert!(supervisor.take_s3_expired());
        assert!(!supervisor.take_s3_expired());
    }

    #[test]
    fn test_s3_stopped_while_service_runs() {
        let (mut supervisor, mut session, clock, _) = setup(TimingConfig::default());
        session.enter_session(SessionState::Programming).unwrap();
        supervisor.begin_service(0x31);

        clock.advance(8000);
        supervisor.poll(&mut session);
        assert!(!supervisor.take_s3_expired());
        assert_eq!(supervisor.timers().tester_present_remaining, 5000);

        // Restarted by the final response
        clock.advance(1000);
        supervisor.poll(&mut session);
        supervisor.end_service();
        assert_eq!(supervisor.timers().tester_present_remaining, 5000);
        clock.advance(4999);
        supervisor.poll(&mut session);
        assert!(!supervisor.take_s3_expired());
        clock.advance(1);
        supervisor.poll(&mut session);
        assert!(supervisor.take_s3_expired());
    }

    #[test]
    fn test_response_pending_sent_before_deadline() {
        let (mut supervisor, mut session, clock, transport) = setup(TimingConfig::default());
        session.set(Flag::ResponsePendingAllowed).unwrap();
        supervisor.begin_service(0x31);

        clock.advance(39);
        supervisor.poll(&mut session);
        assert!(transport.pending_frames().is_empty());

        // 50 ms P2 with a 10 ms margin
        clock.advance(1);
        supervisor.poll(&mut session);
        assert_eq!(transport.pending_frames(), vec![0x31]);
        assert!(session.check(Flag::ResponsePendingInProgress));
        assert_eq!(supervisor.timers().response_pending_remaining, 5000);

        clock.advance(4990);
        supervisor.poll(&mut session);
        assert_eq!(transport.pending_frames(), vec![0x31, 0x31]);

        supervisor.end_service();
        clock.advance(10_000);
        supervisor.poll(&mut session);
        assert_eq!(transport.pending_frames().len(), 2);
    }

    #[test]
    fn test_no_response_pending_when_not_allowed() {
        let (mut supervisor, mut session, clock, transport) = setup(TimingConfig::default());
        supervisor.begin_service(0x22);
        clock.advance(100);
        supervisor.poll(&mut session);
        assert!(transport.pending_frames().is_empty());
        assert_eq!(supervisor.timers().response_pending_remaining, 0);
    }

    #[test]
    fn test_sleep_timer_in_default_session() {
        let timing = TimingConfig {
            sleep_ms: 1000,
            ..TimingConfig::default()
        };
        let (mut supervisor, mut session, clock, _) = setup(timing);
        clock.advance(999);
        supervisor.poll(&mut session);
        assert!(!supervisor.take_sleep_expired());
        clock.advance(1);
        supervisor.poll(&mut session);
        assert!(supervisor.take_sleep_expired());
    }

    #[test]
    fn test_halted_supervisor_stops_watchdog() {
        let (mut supervisor, mut session, clock, _) = setup(TimingConfig::default());
        supervisor.halt();
        supervisor.poll(&mut session);
        assert_eq!(clock.triggers(), 0);
        assert!(supervisor.is_halted());
    }
}
