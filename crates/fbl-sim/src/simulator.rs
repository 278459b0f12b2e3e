//! Bootloader lifecycle on the host
//!
//! Flash lives in RAM for the lifetime of the process and metadata in a JSON
//! file, so both survive the in-process resets the core requests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fbl_core::{
    Bootloader, Drivers, Event, FblConfig, MemoryFacade, ProcessorRegistry, StartupDecision,
    Transport,
};
use tracing::{debug, error, info, warn};

use crate::hardware::{HostClock, JsonMetadataStore, ParkedVehicle, SharedSecretSecurity, SimFlash};
use crate::transport::{try_read, IsoTpTransport, SharedSocket};

/// Everything that persists across a simulated reset
#[derive(Clone)]
pub struct SimHardware {
    config: FblConfig,
    flash: SimFlash,
    nv_file: PathBuf,
    secret: Vec<u8>,
}

impl SimHardware {
    /// One RAM flash device spanning every configured block
    pub fn new(config: FblConfig, nv_file: PathBuf, secret: Vec<u8>) -> Self {
        let blocks = &config.blocks.blocks;
        let start = blocks.iter().map(|b| b.start).min().unwrap_or(0);
        let end = blocks
            .iter()
            .map(|b| b.start.saturating_add(b.length))
            .max()
            .unwrap_or(start);
        info!(
            start = format!("0x{:08X}", start),
            length = end - start,
            "RAM flash device"
        );
        Self {
            flash: SimFlash::new(start, end - start),
            config,
            nv_file,
            secret,
        }
    }

    pub fn flash(&self) -> &SimFlash {
        &self.flash
    }

    fn drivers(&self, transport: Box<dyn Transport>) -> Result<Drivers> {
        let (start, length) = self.flash.range();
        let mut memory = MemoryFacade::new();
        memory.add_device("ram-flash", start, length, Box::new(self.flash.clone()));

        Ok(Drivers {
            watchdog: Box::new(HostClock::new()),
            transport,
            memory,
            metadata: Box::new(JsonMetadataStore::open(&self.nv_file)?),
            security: Box::new(SharedSecretSecurity::new(
                self.secret.clone(),
                self.config.security.seed_length,
            )),
            conditions: Box::new(ParkedVehicle),
            processors: ProcessorRegistry::default(),
        })
    }

    /// Power-on: build a fresh core over the persistent hardware and run
    /// its startup sequence
    pub fn boot(&self, transport: Box<dyn Transport>) -> Result<Bootloader> {
        let mut bootloader = Bootloader::new(self.config.clone(), self.drivers(transport)?)?;
        match bootloader.start()? {
            StartupDecision::StartApplication => {
                // No application image runs on the host
                info!("Application valid; staying in bootloader for the simulation")
            }
            StartupDecision::StayInBootloader => info!("Bootloader active"),
        }
        Ok(bootloader)
    }
}

/// Outcome of handling one core event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Reset,
    Stop,
}

/// What the host does with a core event
pub fn handle_event(event: Event) -> Control {
    match event {
        Event::ResetRequested(kind) => {
            info!(?kind, "Reset requested, rebooting bootloader");
            Control::Reset
        }
        Event::SessionTimeout => {
            info!("Session timed out");
            Control::Continue
        }
        Event::SleepRequested => {
            info!("Sleep requested; ignored on the host");
            Control::Continue
        }
        Event::Halted => {
            error!("Bootloader halted after a fatal error");
            Control::Stop
        }
    }
}

/// Blocking request loop. Runs until `running` is cleared or the core halts.
pub fn run(hardware: SimHardware, socket: SharedSocket, running: Arc<AtomicBool>) -> Result<()> {
    let transport = || Box::new(IsoTpTransport::new(socket.clone())) as Box<dyn Transport>;
    let mut bootloader = hardware.boot(transport())?;

    while running.load(Ordering::SeqCst) {
        let idle = match try_read(&socket) {
            Ok(Some(request)) => {
                debug!(request = %hex::encode(&request), "Received UDS request");
                bootloader.on_request(&request);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(?e, "Socket read error");
                std::thread::sleep(Duration::from_millis(100));
                true
            }
        };

        while let Some(event) = bootloader.poll() {
            match handle_event(event) {
                Control::Continue => {}
                Control::Reset => bootloader = hardware.boot(transport())?,
                Control::Stop => return Ok(()),
            }
        }

        if idle {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    info!("Request loop stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fbl_core::mock::RecordingTransport;
    use fbl_core::{Phase, ResetKind};
    use pretty_assertions::assert_eq;

    const SECRET: [u8; 2] = [0x12, 0x34];

    fn hardware(dir: &tempfile::TempDir) -> SimHardware {
        SimHardware::new(
            FblConfig::default(),
            dir.path().join("nv.json"),
            SECRET.to_vec(),
        )
    }

    fn send(bl: &mut Bootloader, transport: &RecordingTransport, request: &[u8]) -> Vec<u8> {
        transport.clear();
        bl.on_request(request);
        transport.last_response().unwrap_or_default()
    }

    fn unlock(bl: &mut Bootloader, transport: &RecordingTransport) {
        send(bl, transport, &[0x10, 0x02]);
        let seed = send(bl, transport, &[0x27, 0x01]);
        let key = SharedSecretSecurity::new(SECRET.to_vec(), 4).key_for(&seed[2..]);
        let mut request = vec![0x27, 0x02];
        request.extend(key);
        assert_eq!(send(bl, transport, &request), vec![0x67, 0x02]);
    }

    #[test]
    fn test_flash_spans_block_table() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(hardware(&dir).flash().range(), (0x0001_0000, 0x0001_8000));
    }

    #[test]
    fn test_programmed_image_survives_reset() {
        let dir = tempfile::tempdir().unwrap();
        let hw = hardware(&dir);
        let transport = RecordingTransport::new();
        let mut bl = hw.boot(Box::new(transport.clone())).unwrap();
        unlock(&mut bl, &transport);

        let mut erase = vec![0x31, 0x01, 0xFF, 0x00, 0x44];
        erase.extend_from_slice(&0x0001_0000u32.to_be_bytes());
        erase.extend_from_slice(&0x0001_0000u32.to_be_bytes());
        assert_eq!(send(&mut bl, &transport, &erase), vec![0x71, 0x01, 0xFF, 0x00, 0x00]);

        let image = [0xC3u8; 64];
        let download = [0x34, 0x00, 0x44, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40];
        assert_eq!(send(&mut bl, &transport, &download)[0], 0x74);
        let mut transfer = vec![0x36, 0x01];
        transfer.extend_from_slice(&image);
        assert_eq!(send(&mut bl, &transport, &transfer), vec![0x76, 0x01]);
        assert_eq!(send(&mut bl, &transport, &[0x37]), vec![0x77]);

        let crc = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC).checksum(&image);
        let mut check = vec![0x31, 0x01, 0x02, 0x02];
        check.extend_from_slice(&crc.to_be_bytes());
        assert_eq!(
            send(&mut bl, &transport, &check),
            vec![0x71, 0x01, 0x02, 0x02, 0x00]
        );
        assert_eq!(bl.phase(), Phase::Verified);

        assert_eq!(
            send(&mut bl, &transport, &[0x31, 0x01, 0xFF, 0x01]),
            vec![0x71, 0x01, 0xFF, 0x01, 0x00]
        );
        send(&mut bl, &transport, &[0x11, 0x01]);
        let event = bl.poll().unwrap();
        assert_eq!(event, Event::ResetRequested(ResetKind::Hard));
        assert_eq!(handle_event(event), Control::Reset);

        // Reboot with the same hardware
        transport.clear();
        let mut bl = hw.boot(Box::new(transport.clone())).unwrap();
        assert_eq!(transport.responses(), vec![vec![0x51, 0x01]]);
        assert!(bl.metadata().appl_valid().unwrap());
        assert!(bl.metadata().block_valid(0).unwrap());
        assert_eq!(hw.flash().contents(0x0001_0000, 64), Some(image.to_vec()));
    }

    #[test]
    fn test_halt_stops_the_loop() {
        assert_eq!(handle_event(Event::Halted), Control::Stop);
        assert_eq!(handle_event(Event::SessionTimeout), Control::Continue);
    }
}
