//! D2D configuration
//!
//! Reads from ~/.trends/d2d.toml, or from the file named by `TRENDS_D2D_CONFIG`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transfer::Backpressure;
use crate::transport::RtcConfig;

/// Environment variable overriding the config path
pub const CONFIG_ENV: &str = "TRENDS_D2D_CONFIG";

/// Default public STUN servers
pub const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// Top-level config structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct D2dConfig {
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

impl Default for D2dConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            transfer: TransferConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

/// Sender-side flow control
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Pause sending while the channel buffers more than this many bytes
    #[serde(default = "default_buffered_amount_high")]
    pub buffered_amount_high: usize,
    #[serde(default = "default_backpressure_poll_ms")]
    pub backpressure_poll_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            buffered_amount_high: default_buffered_amount_high(),
            backpressure_poll_ms: default_backpressure_poll_ms(),
        }
    }
}

/// What to do with an incoming call while another one is ringing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BusyPolicy {
    /// Mark the newer invitation rejected
    Reject,
    /// Reject the ringing call and surface the newer one
    Replace,
}

/// Per-session behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sent as `senderName` with chat messages
    #[serde(default)]
    pub display_name: String,
    /// Envelope ids remembered per peer for de-duplication
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
    /// Answer data-only invitations without asking
    #[serde(default = "default_true")]
    pub auto_answer_chat: bool,
    #[serde(default = "default_busy_policy")]
    pub busy_policy: BusyPolicy,
    /// Give up on an unanswered outgoing call. 0 disables.
    #[serde(default = "default_ring_timeout_secs")]
    pub ring_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            display_name: String::new(),
            dedup_window: default_dedup_window(),
            auto_answer_chat: true,
            busy_policy: default_busy_policy(),
            ring_timeout_secs: default_ring_timeout_secs(),
        }
    }
}

fn default_ice_servers() -> Vec<String> {
    DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect()
}

fn default_buffered_amount_high() -> usize {
    1024 * 1024
}

fn default_backpressure_poll_ms() -> u64 {
    50
}

fn default_dedup_window() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_busy_policy() -> BusyPolicy {
    BusyPolicy::Reject
}

fn default_ring_timeout_secs() -> u64 {
    45
}

impl D2dConfig {
    /// Load config from a file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Parse config from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Load from the default location, falling back to defaults
    pub fn load_or_default() -> Self {
        let path = get_config_path();
        if !path.exists() {
            return Self::default();
        }
        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring unreadable config {}: {:#}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Save config to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Connection hints handed to the transport
    pub fn rtc(&self) -> RtcConfig {
        RtcConfig {
            ice_servers: self.ice_servers.clone(),
        }
    }

    pub fn backpressure(&self) -> Backpressure {
        Backpressure {
            high_water_mark: self.transfer.buffered_amount_high,
            poll_interval: Duration::from_millis(self.transfer.backpressure_poll_ms.max(1)),
        }
    }

    pub fn ring_timeout(&self) -> Option<Duration> {
        match self.session.ring_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Get the trends config directory (~/.trends)
pub fn get_trends_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".trends")
}

/// Get the config file path, honouring `TRENDS_D2D_CONFIG`
pub fn get_config_path() -> PathBuf {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => get_trends_dir().join("d2d.toml"),
    }
}
