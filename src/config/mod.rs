use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bridge::{Bridge, BridgeSettings};
use crate::lock::LockSettings;
use crate::paths::Paths;
use crate::sweeper::SweepSettings;
use crate::tmux::TmuxMultiplexer;

#[derive(Debug, Default, Clone, Deserialize, Serialize, PartialEq)]
pub struct StoreConfig {
    /// Database file. Defaults to `<home>/tether.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LockConfig {
    #[serde(default = "default_hook_timeout_secs")]
    pub hook_timeout_secs: u64,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_poll_millis")]
    pub poll_millis: u64,
}

/// Terminal bridge tuning.
///
/// ```toml
/// [bridge]
/// binary = "/opt/homebrew/bin/tmux"
/// verify = false
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BridgeConfig {
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default = "default_command_timeout_millis")]
    pub command_timeout_millis: u64,
    #[serde(default = "default_true")]
    pub ghost_probe: bool,
    #[serde(default = "default_ghost_wait_millis")]
    pub ghost_wait_millis: u64,
    #[serde(default = "default_true")]
    pub verify: bool,
    #[serde(default = "default_enter_delay_millis")]
    pub enter_delay_millis: u64,
    #[serde(default = "default_verify_delay_millis")]
    pub verify_delay_millis: u64,
    #[serde(default = "default_key_delay_millis")]
    pub key_delay_millis: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ReconcilerConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_match_window_secs")]
    pub match_window_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SweeperConfig {
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
    #[serde(default = "default_context_interval_secs")]
    pub context_interval_secs: u64,
    /// Agents silent for longer than this are reaped.
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    /// Newly registered agents are exempt from the pane watchdog this long.
    #[serde(default = "default_registration_grace_secs")]
    pub registration_grace_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_hook_timeout_secs() -> u64 {
    30
}

fn default_lease_secs() -> u64 {
    300
}

fn default_poll_millis() -> u64 {
    25
}

fn default_binary() -> String {
    "tmux".to_string()
}

fn default_command_timeout_millis() -> u64 {
    5000
}

fn default_ghost_wait_millis() -> u64 {
    150
}

fn default_enter_delay_millis() -> u64 {
    100
}

fn default_verify_delay_millis() -> u64 {
    300
}

fn default_key_delay_millis() -> u64 {
    50
}

fn default_reconcile_interval_secs() -> u64 {
    2
}

fn default_match_window_secs() -> u64 {
    120
}

fn default_reaper_interval_secs() -> u64 {
    60
}

fn default_watchdog_interval_secs() -> u64 {
    15
}

fn default_context_interval_secs() -> u64 {
    30
}

fn default_inactivity_timeout_secs() -> u64 {
    6 * 60 * 60
}

fn default_registration_grace_secs() -> u64 {
    300
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            hook_timeout_secs: default_hook_timeout_secs(),
            lease_secs: default_lease_secs(),
            poll_millis: default_poll_millis(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            command_timeout_millis: default_command_timeout_millis(),
            ghost_probe: true,
            ghost_wait_millis: default_ghost_wait_millis(),
            verify: true,
            enter_delay_millis: default_enter_delay_millis(),
            verify_delay_millis: default_verify_delay_millis(),
            key_delay_millis: default_key_delay_millis(),
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval_secs(),
            match_window_secs: default_match_window_secs(),
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            reaper_interval_secs: default_reaper_interval_secs(),
            watchdog_interval_secs: default_watchdog_interval_secs(),
            context_interval_secs: default_context_interval_secs(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            registration_grace_secs: default_registration_grace_secs(),
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
}

impl Config {
    /// Load `<home>/config.toml`. Returns the default config if the file
    /// does not exist.
    pub fn load(paths: &Paths) -> Result<(Self, Option<PathBuf>)> {
        let path = paths.config_file();
        if !path.is_file() {
            return Ok((Config::default(), None));
        }
        let config = Self::load_file(&path)?;
        Ok((config, Some(path)))
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Database location; relative paths resolve against the home directory.
    pub fn database_path(&self, paths: &Paths) -> PathBuf {
        match &self.store.database {
            Some(db) if db.is_absolute() => db.clone(),
            Some(db) => paths.home().join(db),
            None => paths.default_database(),
        }
    }

    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            lease: Duration::from_secs(self.locks.lease_secs),
            poll_interval: Duration::from_millis(self.locks.poll_millis.max(1)),
        }
    }

    pub fn hook_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.locks.hook_timeout_secs)
    }

    pub fn match_window(&self) -> chrono::Duration {
        secs(self.reconciler.match_window_secs)
    }

    pub fn sweep_settings(&self) -> SweepSettings {
        SweepSettings {
            inactivity_timeout: secs(self.sweeper.inactivity_timeout_secs),
            registration_grace: secs(self.sweeper.registration_grace_secs),
            match_window: self.match_window(),
        }
    }

    pub fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            ghost_probe: self.bridge.ghost_probe,
            ghost_wait: Duration::from_millis(self.bridge.ghost_wait_millis),
            verify: self.bridge.verify,
            enter_delay: Duration::from_millis(self.bridge.enter_delay_millis),
            verify_delay: Duration::from_millis(self.bridge.verify_delay_millis),
            key_delay: Duration::from_millis(self.bridge.key_delay_millis),
        }
    }

    pub fn multiplexer(&self) -> TmuxMultiplexer {
        TmuxMultiplexer::new(
            self.bridge.binary.clone(),
            Duration::from_millis(self.bridge.command_timeout_millis.max(1)),
        )
    }

    pub fn bridge(&self) -> Bridge<TmuxMultiplexer> {
        Bridge::new(self.multiplexer(), self.bridge_settings())
    }
}

fn secs(value: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1000))
}
