//! Daemon configuration.
//!
//! Loaded once from a TOML file at startup and handed to the components
//! that need it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    /// Required in remote mode.
    #[serde(default)]
    pub panel: Option<PanelConfig>,
    #[serde(default)]
    pub xray: XrayConfig,
    #[serde(default)]
    pub local: LocalConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Remote,
    Local,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_mode")]
    pub mode: SyncMode,
    /// Pause between the end of one cycle and the start of the next.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// How long an interrupted cycle may keep running after shutdown is
    /// requested.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            interval_secs: default_interval_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PanelKind {
    #[serde(alias = "ss-panel")]
    SsPanel,
    V2Board,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PanelConfig {
    pub kind: PanelKind,
    pub endpoint: String,
    pub api_key: String,
    pub node_id: i64,
    /// V2Board only: `vmess`, `vless`, `shadowsocks` or `trojan`.
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default = "default_panel_timeout_secs")]
    pub timeout_secs: u64,
}

impl PanelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct XrayConfig {
    #[serde(default = "default_api_host")]
    pub api_host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// When set, the daemon runs the engine itself.
    #[serde(default)]
    pub executable: Option<PathBuf>,
    #[serde(default)]
    pub config_dir: Option<PathBuf>,
    /// Certificate for TLS inbounds.
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

impl Default for XrayConfig {
    fn default() -> Self {
        Self {
            api_host: default_api_host(),
            api_port: default_api_port(),
            call_timeout_secs: default_call_timeout_secs(),
            executable: None,
            config_dir: None,
            cert_path: None,
            key_path: None,
        }
    }
}

impl XrayConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// Declarative nodes and users for local mode.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalConfig {
    #[serde(default)]
    pub nodes: Vec<LocalNode>,
    #[serde(default)]
    pub users: Vec<LocalUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalNode {
    pub node_id: i64,
    pub protocol: String,
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    pub listen_port: u16,
    #[serde(default)]
    pub cipher_method: String,
    #[serde(default)]
    pub alter_id: u32,
    #[serde(default)]
    pub transport: String,
    #[serde(default)]
    pub enable_tls: bool,
    #[serde(default)]
    pub tls_type: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub enable_xtls: bool,
    #[serde(default)]
    pub enable_vless: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalUser {
    pub user_id: i64,
    pub node_id: i64,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub speed_limit: u64,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default, alias = "cipher_type")]
    pub method: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_mode() -> SyncMode {
    SyncMode::Remote
}

fn default_interval_secs() -> u64 {
    60
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_panel_timeout_secs() -> u64 {
    15
}

fn default_api_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    10085
}

fn default_call_timeout_secs() -> u64 {
    10
}

fn default_listen_host() -> String {
    xnode_shared::DEFAULT_LISTEN_HOST.to_string()
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync.interval_secs == 0 {
            bail!("sync.interval_secs must be greater than zero");
        }
        match self.sync.mode {
            SyncMode::Remote => {
                let Some(panel) = &self.panel else {
                    bail!("remote mode requires a [panel] section");
                };
                url::Url::parse(&panel.endpoint)
                    .with_context(|| format!("panel.endpoint {:?} is not a URL", panel.endpoint))?;
                if panel.api_key.trim().is_empty() {
                    bail!("panel.api_key must not be empty");
                }
                if panel.kind == PanelKind::V2Board && panel.node_type.is_none() {
                    bail!("v2board panels require panel.node_type");
                }
            }
            SyncMode::Local => {
                if self.local.nodes.is_empty() {
                    bail!("local mode requires at least one [[local.nodes]] entry");
                }
            }
        }
        if self.xray.executable.is_some() && self.xray.config_dir.is_none() {
            bail!("xray.executable requires xray.config_dir");
        }
        Ok(())
    }
}

/// Starting point written by `xnode init`.
pub const TEMPLATE: &str = r#"# xnode

[log]
level = "info" # trace/debug/info/warn/error

[sync]
mode = "remote" # remote/local
interval_secs = 60

[panel]
kind = "sspanel" # sspanel/v2board
endpoint = "https://panel.example.com/"
api_key = "key"
node_id = 1
# node_type = "vmess" # v2board only: vmess/vless/shadowsocks/trojan

[xray]
api_host = "127.0.0.1"
api_port = 10085
# executable = "/usr/local/bin/xray"
# config_dir = "/etc/xnode/xray"

# [[local.nodes]]
# node_id = 1
# protocol = "shadowsocks"
# listen_port = 1234
# cipher_method = "aes-256-gcm"

# [[local.users]]
# user_id = 1
# node_id = 1
# password = "aabbccdd"
"#;

/// Write [`TEMPLATE`] to `path` unless a file is already there.
pub fn write_template(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, TEMPLATE)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}
