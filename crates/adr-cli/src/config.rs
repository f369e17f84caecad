//! IOC configuration file – `~/.adr-ioc/config.toml`.
//!
//! Every field is optional in the file; missing ones take the defaults
//! below.  `ADR_*` environment variables are applied on top by
//! [`apply_env_overrides`].

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use adr_bridge::{Backoff, StartCyclePolicy};
use adr_registry::DEFAULT_PREFIX;
use adr_runtime::IocConfig;
use serde::{Deserialize, Serialize};

/// How `START_CYCLE` writes are turned into device commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum StartCycleMode {
    #[default]
    EveryWrite,
    RisingEdge,
    MinInterval,
}

impl std::fmt::Display for StartCycleMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartCycleMode::EveryWrite => write!(f, "every-write"),
            StartCycleMode::RisingEdge => write!(f, "rising-edge"),
            StartCycleMode::MinInterval => write!(f, "min-interval"),
        }
    }
}

/// Persisted IOC settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Host running the ADR controller.
    #[serde(default = "default_address")]
    pub address: String,

    /// Status publisher port.
    #[serde(default = "default_sub_port")]
    pub sub_port: u16,

    /// Command endpoint port.
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Prefix prepended to every variable name.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    #[serde(default = "default_true")]
    pub gateway_enabled: bool,

    #[serde(default = "default_gateway_port")]
    pub gateway_port: u16,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Timed-out reads before resubscribing; 0 never resubscribes.
    #[serde(default = "default_max_silent_reads")]
    pub max_silent_reads: u32,

    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    #[serde(default)]
    pub start_cycle_policy: StartCycleMode,

    /// Only used with `min-interval`.
    #[serde(default = "default_start_cycle_interval_ms")]
    pub start_cycle_interval_ms: u64,
}

fn default_address() -> String {
    "10.66.48.41".to_string()
}
fn default_sub_port() -> u16 {
    5021
}
fn default_control_port() -> u16 {
    5020
}
fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}
fn default_true() -> bool {
    true
}
fn default_gateway_port() -> u16 {
    9090
}
fn default_read_timeout_ms() -> u64 {
    5_000
}
fn default_max_silent_reads() -> u32 {
    3
}
fn default_send_timeout_ms() -> u64 {
    2_000
}
fn default_reconnect_initial_ms() -> u64 {
    500
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}
fn default_start_cycle_interval_ms() -> u64 {
    1_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: default_address(),
            sub_port: default_sub_port(),
            control_port: default_control_port(),
            prefix: default_prefix(),
            gateway_enabled: true,
            gateway_port: default_gateway_port(),
            read_timeout_ms: default_read_timeout_ms(),
            max_silent_reads: default_max_silent_reads(),
            send_timeout_ms: default_send_timeout_ms(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            start_cycle_policy: StartCycleMode::default(),
            start_cycle_interval_ms: default_start_cycle_interval_ms(),
        }
    }
}

impl Config {
    /// Runtime settings for [`adr_runtime::Ioc`].
    pub fn to_ioc_config(&self) -> IocConfig {
        let start_cycle_policy = match self.start_cycle_policy {
            StartCycleMode::EveryWrite => StartCyclePolicy::EveryWrite,
            StartCycleMode::RisingEdge => StartCyclePolicy::RisingEdge,
            StartCycleMode::MinInterval => {
                StartCyclePolicy::MinInterval(Duration::from_millis(self.start_cycle_interval_ms))
            }
        };
        IocConfig {
            address: self.address.clone(),
            sub_port: self.sub_port,
            control_port: self.control_port,
            prefix: self.prefix.clone(),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            max_silent_reads: self.max_silent_reads,
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            backoff: Backoff {
                initial: Duration::from_millis(self.reconnect_initial_ms),
                max: Duration::from_millis(self.reconnect_max_ms),
                ..Backoff::default()
            },
            start_cycle_policy,
            gateway_addr: self
                .gateway_enabled
                .then(|| SocketAddr::from(([0, 0, 0, 0], self.gateway_port))),
        }
    }
}

/// Return the path to `~/.adr-ioc/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".adr-ioc").join("config.toml")
}

/// Load the file at `path`.  Returns `None` if it does not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// File (or defaults when it is missing) with environment overrides applied.
pub fn resolve(path: &Path) -> Result<Config, String> {
    let mut cfg = load_from(path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Apply `ADR_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `ADR_ADDRESS` | `address` |
/// | `ADR_SUB_PORT` | `sub_port` |
/// | `ADR_CONTROL_PORT` | `control_port` |
/// | `ADR_PREFIX` | `prefix` |
/// | `ADR_GATEWAY_PORT` | `gateway_port` |
///
/// Unparsable ports are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("ADR_ADDRESS") {
        cfg.address = v;
    }
    if let Ok(v) = std::env::var("ADR_SUB_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.sub_port = port;
    }
    if let Ok(v) = std::env::var("ADR_CONTROL_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.control_port = port;
    }
    if let Ok(v) = std::env::var("ADR_PREFIX") {
        cfg.prefix = v;
    }
    if let Ok(v) = std::env::var("ADR_GATEWAY_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.gateway_port = port;
    }
}
