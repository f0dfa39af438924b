use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use log::debug;

use crate::storage::file::{Config, FileIoWithBackup};

pub const CONFIG_ENV: &str = "DSFLEET_CONFIG";
const CONFIG_FILE_NAME: &str = "dsfleet.json";

const DEFAULT_START_SCRIPT: &str = r#"#!/bin/bash

NOUPDATE=""
if [ -z "$1" ]; then
    NOUPDATE="-noupdate"
fi

WINEPREFIX={prefix} WINEDEBUG=fixme-all wine Torch.Server.exe -nogui $NOUPDATE -ticktimeout 60 -autostart -instancepath {instance_path} -instancename "{server_name}"
"#;

/// Host-wide settings. Loaded once per invocation and passed down explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Base for every relative path below (defaults to the home directory).
    pub root: PathBuf,
    /// Deployment tag written into the hosting plugin config (dev, test, prod).
    pub environment: String,
    /// Account name used inside the Wine prefix.
    pub user_name: String,
    /// Address advertised to the hosting plugin; looked up from the host name when absent.
    pub host_ip: Option<String>,
    /// Versioned fatal-marker file; the built-in set is used when absent.
    pub markers_path: Option<PathBuf>,
    pub layout: LayoutConfig,
    pub network: NetworkConfig,
    pub timing: TimingConfig,
    pub process: ProcessConfig,
    pub provision: ProvisionConfig,
    pub archive: ArchiveConfig,
    /// Priority class to nice level.
    pub priorities: BTreeMap<String, i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub server_dir_prefix: String,
    pub prefix_dir_prefix: String,
    pub template_number: u8,
    pub plugins_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub assets_dir: PathBuf,
    pub content_cache_dir: PathBuf,
    pub binary_cache_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub base_port: u16,
    pub admin_base_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub canary_timeout_secs: u64,
    pub startup_timeout_secs: u64,
    pub recovery_cooldown_secs: u64,
    pub kill_attempts: u32,
    pub kill_interval_ms: u64,
    pub removal_retry_delay_ms: u64,
    pub keepalive_stop_grace_ms: u64,
    pub log_tail_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Substring of argv[0] identifying the workload.
    pub executable: String,
    /// Flag whose presence, next to the instance path, ties a process to an instance.
    pub instance_path_flag: String,
    /// Detached launch command, run in the server dir. Supports `{number}` and `{server_dir}`.
    pub launch_command: Vec<String>,
    /// Extra argument appended when a game update is requested.
    pub update_arg: String,
    /// Launch script template. Supports `{prefix}`, `{instance_path}` and `{server_name}`.
    pub start_script: String,
    pub log_prefix: String,
    pub log_suffix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Extensions that are hard linked from the template instead of copied.
    pub link_extensions: Vec<String>,
    /// Extensions never cloned from the template.
    pub skip_extensions: Vec<String>,
    /// Plugin always extracted, first.
    pub required_plugin: String,
    /// Save files covered by the world checksum, in digest order.
    pub world_files: Vec<String>,
    /// Compiled world file held in the binary cache.
    pub artifact_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Entries of the server dir kept by a partial archive.
    pub retained: Vec<String>,
}

impl FileIoWithBackup for HostConfig {}

impl Config for HostConfig {
    type ConfigType = HostConfig;
}

fn words(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_string).collect()
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            root: home::home_dir().unwrap_or_else(|| PathBuf::from(".")),
            environment: "dev".to_string(),
            user_name: std::env::var("USER").unwrap_or_else(|_| "ds".to_string()),
            host_ip: None,
            markers_path: None,
            layout: LayoutConfig::default(),
            network: NetworkConfig::default(),
            timing: TimingConfig::default(),
            process: ProcessConfig::default(),
            provision: ProvisionConfig::default(),
            archive: ArchiveConfig::default(),
            priorities: BTreeMap::from([
                ("low".to_string(), 10),
                ("normal".to_string(), 0),
                ("high".to_string(), -10),
            ]),
        }
    }
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            server_dir_prefix: "ds".to_string(),
            prefix_dir_prefix: ".wine".to_string(),
            template_number: 0,
            plugins_dir: "plugins".into(),
            archive_dir: "archive".into(),
            assets_dir: "asteroids".into(),
            content_cache_dir: ".cache".into(),
            binary_cache_dir: ".cache/binary_cache".into(),
            lock_dir: ".local".into(),
            log_dir: "logs".into(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base_port: 27000,
            admin_base_port: 9000,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            canary_timeout_secs: 3 * 60,
            startup_timeout_secs: 8 * 60,
            recovery_cooldown_secs: 30,
            kill_attempts: 50,
            kill_interval_ms: 100,
            removal_retry_delay_ms: 1000,
            keepalive_stop_grace_ms: 2000,
            log_tail_bytes: 1024 * 1024,
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            executable: "Torch.Server.exe".to_string(),
            instance_path_flag: "-instancepath".to_string(),
            launch_command: words("xvfb-run -a -n {number} bash start"),
            update_arg: "update".to_string(),
            start_script: DEFAULT_START_SCRIPT.to_string(),
            log_prefix: "Keen-".to_string(),
            log_suffix: ".log".to_string(),
        }
    }
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            link_extensions: words(
                "bat cmd exe dll sys drv bin ocx manifest config pdb msi zip mui hlsl hlsli inl asar \
                 bmp png jpg gif ico html css js mwm pak aspx resx dds vs xml txt scf sbl sbx vsc gsc \
                 hkt mwl vx2 hash nlp h rtf pdf old sql nls vxd xsd master mof tlb rsp man msu cs mod \
                 ascx brain",
            ),
            skip_extensions: words("log cache hash sbcB5 sbsB5"),
            required_plugin: "Hosting".to_string(),
            world_files: words("Sandbox.sbc Sandbox_config.sbc SANDBOX_0_0_0_.sbs"),
            artifact_file: "SANDBOX_0_0_0_.sbsB5".to_string(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            retained: words("Instance Logs Torch.cfg start start.log zip_path"),
        }
    }
}

impl HostConfig {
    /// Loads the config from `path`, writing the defaults there on first use.
    pub fn load(path: Option<PathBuf>) -> anyhow::Result<HostConfig> {
        let path = path
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(Self::default_path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let config = Self::load_config_or_default(&path, Self::default)
            .with_context(|| format!("failed to load config {}", path.display()))?;
        debug!("config loaded from {}", path.display());
        Ok(config)
    }

    pub fn default_path() -> PathBuf {
        home::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join(CONFIG_FILE_NAME)
    }

    /// Resolves a configured path against `root`.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn canary_timeout(&self) -> Duration {
        Duration::from_secs(self.timing.canary_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.timing.startup_timeout_secs)
    }

    pub fn recovery_cooldown(&self) -> Duration {
        Duration::from_secs(self.timing.recovery_cooldown_secs)
    }

    pub fn kill_interval(&self) -> Duration {
        Duration::from_millis(self.timing.kill_interval_ms)
    }

    pub fn removal_retry_delay(&self) -> Duration {
        Duration::from_millis(self.timing.removal_retry_delay_ms)
    }

    pub fn keepalive_stop_grace(&self) -> Duration {
        Duration::from_millis(self.timing.keepalive_stop_grace_ms)
    }
}

/// Resolves the advertised host address once per invocation.
pub fn resolve_host_ip(config: &HostConfig) -> anyhow::Result<String> {
    if let Some(ip) = &config.host_ip {
        return Ok(ip.clone());
    }
    let hostname = nix::unistd::gethostname().context("failed to read host name")?;
    let hostname = hostname.to_string_lossy().to_string();
    let ip = (hostname.as_str(), 0)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve host name {}", hostname))?
        .map(|addr| addr.ip())
        .find(IpAddr::is_ipv4)
        .ok_or_else(|| anyhow!("no IPv4 address found for host name {}", hostname))?;
    Ok(ip.to_string())
}
