//! Simulator configuration
//!
//! One TOML file carries the simulator's own settings (CAN ids, shared
//! secret, metadata file) and the bootloader configuration under
//! `[bootloader]`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fbl_core::FblConfig;
use serde::{Deserialize, Serialize};

/// Complete simulator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Bootloader core configuration
    #[serde(default)]
    pub bootloader: FblConfig,
}

impl SimConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse config")?;
        config.bootloader.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// ISO-TP addressing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// CAN interface
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Bootloader's receive CAN ID (tester sends to this)
    #[serde(default = "default_rx_id")]
    pub rx_id: String,

    /// Bootloader's transmit CAN ID
    #[serde(default = "default_tx_id")]
    pub tx_id: String,
}

fn default_interface() -> String {
    "vcan0".to_string()
}

fn default_rx_id() -> String {
    "0x18DA00F1".to_string()
}

fn default_tx_id() -> String {
    "0x18DAF100".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            rx_id: default_rx_id(),
            tx_id: default_tx_id(),
        }
    }
}

// =============================================================================
// Security / Storage
// =============================================================================

/// Seed/key configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Shared secret (hex string), must match the tester's
    #[serde(default = "default_secret")]
    pub secret: String,
}

fn default_secret() -> String {
    "ff".to_string()
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            secret: default_secret(),
        }
    }
}

/// Persistent metadata location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_nv_file")]
    pub nv_file: PathBuf,
}

fn default_nv_file() -> PathBuf {
    PathBuf::from("fbl-nv.json")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            nv_file: default_nv_file(),
        }
    }
}

// =============================================================================
// Parsing helpers
// =============================================================================

fn strip_hex_prefix(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

/// Parse a CAN ID given as hex, with or without `0x`
pub fn parse_can_id(s: &str) -> Result<u32> {
    u32::from_str_radix(strip_hex_prefix(s), 16).with_context(|| format!("Invalid CAN ID: {s}"))
}

/// Parse a hex byte string such as `"deadbeef"`
pub fn parse_hex_string(s: &str) -> Result<Vec<u8>> {
    hex::decode(strip_hex_prefix(s)).with_context(|| format!("Invalid hex string: {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fbl_core::DependencyPolicy;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_without_file() {
        let config = SimConfig::from_toml("").unwrap();
        assert_eq!(config.transport.interface, "vcan0");
        assert_eq!(config.storage.nv_file, PathBuf::from("fbl-nv.json"));
        assert_eq!(config.bootloader.blocks.blocks.len(), 2);
    }

    #[test]
    fn test_bootloader_section() {
        let config = SimConfig::from_toml(
            r#"
            [transport]
            interface = "vcan1"

            [bootloader.timing]
            p2_ms = 100

            [bootloader.dependency]
            policy = "blocks_only"
            "#,
        )
        .unwrap();
        assert_eq!(config.transport.interface, "vcan1");
        assert_eq!(config.bootloader.timing.p2_ms, 100);
        assert_eq!(
            config.bootloader.dependency.policy,
            DependencyPolicy::BlocksOnly
        );
    }

    #[test]
    fn test_invalid_bootloader_section_rejected() {
        let result = SimConfig::from_toml(
            r#"
            [bootloader.timing]
            p2_ms = 5
            response_pending_margin_ms = 10
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_shipped_config_loads() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/fbl-sim.toml");
        let config = SimConfig::load(path).unwrap();
        assert_eq!(config.security.secret, "a55a3cc3");
        assert!(config.bootloader.erase.require_fingerprint);
        assert_eq!(config.bootloader.blocks.blocks[1].max_program_attempts, 100);
        assert_eq!(config.bootloader.transfer.max_block_length, 0x0802);
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_can_id("0x18DA00F1").unwrap(), 0x18DA_00F1);
        assert_eq!(parse_can_id("7E0").unwrap(), 0x7E0);
        assert!(parse_can_id("xyz").is_err());
        assert_eq!(parse_hex_string("0xDEADbeef").unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(parse_hex_string("abc").is_err());
    }
}
