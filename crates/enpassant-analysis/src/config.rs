//! Service configuration, loadable from TOML.
//!
//! Defaults follow the bot's historical engine settings (depth 20,
//! 1000ms per move) so a bare `[engine] path = "..."` section is a
//! complete, working config.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use enpassant_uci::SearchLimit;
use serde::Deserialize;

/// How one engine process is started and initialized.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Engine executable path.
    pub path: PathBuf,
    /// Extra command-line arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Options sent right after the handshake, in order. Names unknown to
    /// the engine are skipped (it declared what it supports).
    #[serde(default)]
    pub options: Vec<(String, String)>,
    /// Handshake deadline in milliseconds.
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    /// Grace period after `quit` before the process is killed.
    #[serde(default = "default_quit_grace_ms")]
    pub quit_grace_ms: u64,
}

impl EngineConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            options: Vec::new(),
            ready_timeout_ms: default_ready_timeout_ms(),
            quit_grace_ms: default_quit_grace_ms(),
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn quit_grace(&self) -> Duration {
        Duration::from_millis(self.quit_grace_ms)
    }
}

/// Pool sizing and scheduling policy.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Number of engine slots (>= 1).
    #[serde(default = "default_slots")]
    pub slots: usize,
    /// Wait queue capacity. Zero means a request is only admitted when a
    /// slot is free to take it immediately.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Resubmit a crashed session once to a restarted engine before
    /// surfacing the failure.
    #[serde(default)]
    pub retry_once: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            slots: default_slots(),
            queue_capacity: default_queue_capacity(),
            retry_once: false,
        }
    }
}

/// Per-search bounds and caller-facing deadlines.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Default search depth when a request doesn't override it.
    #[serde(default = "default_depth")]
    pub depth: Option<u32>,
    /// Default search time per request in milliseconds.
    #[serde(default = "default_movetime_ms")]
    pub movetime_ms: Option<u64>,
    /// How long `request_move` blocks before returning `Timeout`.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// No engine output for this long after `go` counts as
    /// desynchronization and triggers a restart.
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            depth: default_depth(),
            movetime_ms: default_movetime_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            stall_timeout_ms: default_stall_timeout_ms(),
        }
    }
}

impl LimitsConfig {
    pub fn search_limit(&self) -> SearchLimit {
        SearchLimit {
            depth: self.depth,
            movetime_ms: self.movetime_ms,
            nodes: None,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub engine: EngineConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl ServiceConfig {
    pub fn new(engine: EngineConfig) -> Self {
        Self {
            engine,
            pool: PoolConfig::default(),
            limits: LimitsConfig::default(),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("failed to parse service config")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&text)
    }
}

fn default_ready_timeout_ms() -> u64 {
    30_000
}

fn default_quit_grace_ms() -> u64 {
    300
}

fn default_slots() -> usize {
    1
}

fn default_queue_capacity() -> usize {
    16
}

fn default_depth() -> Option<u32> {
    Some(20)
}

fn default_movetime_ms() -> Option<u64> {
    Some(1000)
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_stall_timeout_ms() -> u64 {
    60_000
}
