//! Bootloader configuration
//!
//! Timing constants, security policy, transfer limits and the logical block
//! table. Loaded from TOML; every field has a default so a partial file is
//! enough, and [`FblConfig::default`] is a complete two-block layout.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blocks::{BlockTableError, LogicalBlock, LogicalBlockTable, VerificationMode};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error(transparent)]
    BlockTable(#[from] BlockTableError),
}

/// Complete bootloader configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FblConfig {
    /// P2/P2*/S3 and sleep timing
    #[serde(default)]
    pub timing: TimingConfig,

    /// Seed/key lockout policy
    #[serde(default)]
    pub security: SecurityConfig,

    /// TransferData limits
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Session transition policy
    #[serde(default)]
    pub session: SessionConfig,

    /// CheckProgrammingDependencies policy
    #[serde(default)]
    pub dependency: DependencyConfig,

    /// Erase routine switches
    #[serde(default)]
    pub erase: EraseConfig,

    /// Logical block table
    #[serde(default)]
    pub blocks: BlockTableConfig,
}

impl FblConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check timing relationships and the block table
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timing = &self.timing;
        if timing.response_pending_margin_ms >= timing.p2_ms as u32 {
            return Err(ConfigError::Invalid {
                field: "timing.response_pending_margin_ms",
                reason: format!(
                    "margin {} ms must be below P2 ({} ms)",
                    timing.response_pending_margin_ms, timing.p2_ms
                ),
            });
        }
        if timing.response_pending_margin_ms >= timing.p2_star_ms {
            return Err(ConfigError::Invalid {
                field: "timing.response_pending_margin_ms",
                reason: format!(
                    "margin {} ms must be below P2* ({} ms)",
                    timing.response_pending_margin_ms, timing.p2_star_ms
                ),
            });
        }
        if timing.p2_star_ms / 10 > u16::MAX as u32 {
            return Err(ConfigError::Invalid {
                field: "timing.p2_star_ms",
                reason: format!("{} ms does not fit the session response", timing.p2_star_ms),
            });
        }
        if self.security.attempt_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "security.attempt_threshold",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.transfer.max_block_length < 3 {
            return Err(ConfigError::Invalid {
                field: "transfer.max_block_length",
                reason: "must leave room for SID, counter and one data byte".to_string(),
            });
        }
        self.block_table()?;
        Ok(())
    }

    /// Build the validated logical block table
    pub fn block_table(&self) -> Result<LogicalBlockTable, BlockTableError> {
        LogicalBlockTable::new(self.blocks.magic, self.blocks.blocks.clone())
    }
}

// =============================================================================
// Timing
// =============================================================================

/// Supervisory timer configuration (milliseconds)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// P2 server max: time until the first response or RCRRP is due
    #[serde(default = "default_p2_ms")]
    pub p2_ms: u16,

    /// P2* server max: time granted by each RCRRP
    #[serde(default = "default_p2_star_ms")]
    pub p2_star_ms: u32,

    /// RCRRP is sent once the pending timer drops to this margin
    #[serde(default = "default_response_pending_margin_ms")]
    pub response_pending_margin_ms: u32,

    /// S3 server: non-default session keep-alive
    #[serde(default = "default_s3_ms")]
    pub s3_ms: u32,

    /// Idle time in the default session before sleep is requested (0 = never)
    #[serde(default)]
    pub sleep_ms: u32,
}

fn default_p2_ms() -> u16 {
    50
}

fn default_p2_star_ms() -> u32 {
    5000
}

fn default_response_pending_margin_ms() -> u32 {
    10
}

fn default_s3_ms() -> u32 {
    5000
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            p2_ms: default_p2_ms(),
            p2_star_ms: default_p2_star_ms(),
            response_pending_margin_ms: default_response_pending_margin_ms(),
            s3_ms: default_s3_ms(),
            sleep_ms: 0,
        }
    }
}

// =============================================================================
// Security
// =============================================================================

/// Security access lockout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Consecutive invalid keys that activate the delay
    #[serde(default = "default_attempt_threshold")]
    pub attempt_threshold: u8,

    /// Lockout delay in milliseconds
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u32,

    /// Seed length in bytes
    #[serde(default = "default_seed_length")]
    pub seed_length: usize,
}

fn default_attempt_threshold() -> u8 {
    3
}

fn default_delay_ms() -> u32 {
    10_000
}

fn default_seed_length() -> usize {
    4
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            attempt_threshold: default_attempt_threshold(),
            delay_ms: default_delay_ms(),
            seed_length: default_seed_length(),
        }
    }
}

// =============================================================================
// Transfer
// =============================================================================

/// TransferData configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// maxNumberOfBlockLength reported by RequestDownload, counting SID and
    /// block sequence counter
    #[serde(
        default = "default_max_block_length",
        deserialize_with = "deserialize_hex_u16"
    )]
    pub max_block_length: u16,

    /// Wrong block sequence counters tolerated before the transfer is aborted
    #[serde(default = "default_sequence_retries")]
    pub sequence_retries: u8,
}

fn default_max_block_length() -> u16 {
    0x0802
}

fn default_sequence_retries() -> u8 {
    2
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_block_length: default_max_block_length(),
            sequence_retries: default_sequence_retries(),
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// Session transition policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Default -> Programming requires a successful CheckProgrammingPreconditions
    #[serde(default)]
    pub require_preconditions_routine: bool,

    /// Leaving the programming session for default resets the ECU
    #[serde(default = "default_true")]
    pub reset_on_programming_exit: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            require_preconditions_routine: false,
            reset_on_programming_exit: true,
        }
    }
}

// =============================================================================
// Dependencies and erase
// =============================================================================

/// Precedence between per-block validity and the compatibility check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyPolicy {
    /// Every mandatory block valid and the compatibility check passes
    #[default]
    RequireBoth,
    /// The compatibility check decides; block validity is only reported
    CompatibilityFirst,
    /// Only per-block validity counts
    BlocksOnly,
}

/// CheckProgrammingDependencies configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencyConfig {
    #[serde(default)]
    pub policy: DependencyPolicy,

    /// Re-evaluate application validity at startup instead of trusting the
    /// persisted flag
    #[serde(default)]
    pub check_on_startup: bool,
}

/// Erase routine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EraseConfig {
    /// Reject erase until a fingerprint has been written
    #[serde(default)]
    pub require_fingerprint: bool,
}

// =============================================================================
// Block table
// =============================================================================

/// Logical block table as configured
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockTableConfig {
    /// Table validity marker
    #[serde(default = "default_magic", deserialize_with = "deserialize_hex_u32")]
    pub magic: u32,

    #[serde(default = "default_blocks")]
    pub blocks: Vec<LogicalBlock>,
}

fn default_magic() -> u32 {
    LogicalBlockTable::MAGIC
}

fn default_blocks() -> Vec<LogicalBlock> {
    vec![
        LogicalBlock {
            number: 0,
            name: "application".to_string(),
            start: 0x0001_0000,
            length: 0x0001_0000,
            max_program_attempts: 0,
            verification: VerificationMode::Crc32,
            mandatory: true,
        },
        LogicalBlock {
            number: 1,
            name: "calibration".to_string(),
            start: 0x0002_0000,
            length: 0x0000_8000,
            max_program_attempts: 0,
            verification: VerificationMode::Sha256,
            mandatory: false,
        },
    ]
}

impl Default for BlockTableConfig {
    fn default() -> Self {
        Self {
            magic: default_magic(),
            blocks: default_blocks(),
        }
    }
}

// =============================================================================
// Hex helpers
// =============================================================================

/// Deserialize a hex u16 (supports "0x0802" or 2050)
fn deserialize_hex_u16<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value = deserialize_hex_u32(deserializer)?;
    u16::try_from(value).map_err(|e| D::Error::custom(e.to_string()))
}

/// Deserialize a hex u32 (supports "0x00010000" or 65536)
pub(crate) fn deserialize_hex_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum HexOrInt {
        Hex(String),
        Int(u32),
    }

    match HexOrInt::deserialize(deserializer)? {
        HexOrInt::Int(n) => Ok(n),
        HexOrInt::Hex(s) => {
            let s = s.trim();
            let s = s
                .strip_prefix("0x")
                .or_else(|| s.strip_prefix("0X"))
                .unwrap_or(s);
            u32::from_str_radix(s, 16).map_err(|e| D::Error::custom(e.to_string()))
        }
    }
}
