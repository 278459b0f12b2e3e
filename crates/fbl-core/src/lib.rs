//! fbl-core - UDS flash bootloader core
//!
//! Session and reprogramming-sequence state machine of an ECU flash
//! bootloader. Hardware (CAN, ISO-TP, flash devices, NV storage, crypto) is
//! reached through narrow traits so the same core runs on target and in the
//! host simulator.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Bootloader                           │
//! │                                                             │
//! │  request ──► Dispatcher ──► SessionManager (flags, gates)   │
//! │                  │                                          │
//! │        ┌─────────┼──────────────┐                           │
//! │        ▼         ▼              ▼                           │
//! │  SecurityAccess  DownloadSequencer ──► MemoryFacade         │
//! │        │         │                        │                 │
//! │        ▼         ▼                        ▼ poll()          │
//! │      Metadata (NV handles)           Supervisor             │
//! │                                  (watchdog, S3, P2/P2*)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Execution is single-threaded: [`Supervisor::poll`] is the only yield
//! point and is called from inside long memory operations as well as from
//! [`Bootloader::poll`].

pub mod blocks;
pub mod bootloader;
pub mod config;
pub mod dispatcher;
pub mod download;
pub mod error;
mod handlers;
pub mod memory;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod nvm;
pub mod security;
pub mod session;
pub mod timer;
pub mod uds;

pub use blocks::{LogicalBlock, LogicalBlockTable, VerificationMode};
pub use bootloader::{Bootloader, Drivers, Event, ResetKind, StartupDecision};
pub use config::{ConfigError, DependencyPolicy, FblConfig};
pub use download::{
    DataProcessor, DependencyStatus, DownloadSequencer, Phase, ProcessorRegistry,
    ProgrammingConditions,
};
pub use error::{FatalError, FblError, FblResult};
pub use memory::{MemoryDriver, MemoryError, MemoryFacade, WatchdogPoll};
pub use nvm::{Metadata, MetadataStore, NvError, NvHandle};
pub use security::{SecurityAccess, SecurityModule};
pub use session::{Flag, SessionManager, SessionState};
pub use timer::{Supervisor, Transport, Watchdog};
pub use uds::NegativeResponseCode;
