//! fbl-sim - host-side flash bootloader simulator
//!
//! Runs the `fbl-core` state machine against a SocketCAN ISO-TP socket so a
//! real tester can reprogram a simulated ECU over `vcan`.
//!
//! # Modules
//!
//! - [`config`] - TOML configuration (transport, secret, storage, bootloader)
//! - [`hardware`] - host clock, seed/key module, JSON metadata store
//! - [`transport`] - ISO-TP socket adapter
//! - [`simulator`] - power-on, request loop and in-process resets

pub mod config;
pub mod hardware;
pub mod simulator;
pub mod transport;

pub use config::SimConfig;
pub use simulator::SimHardware;
