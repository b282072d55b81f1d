use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "/usr/local/etc/bsdbt/bsdbtd.toml";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    /// Netgraph HCI node used for inquiries.
    pub hci_node: String,
    pub hcsecd_conf: PathBuf,
    pub tools: ToolsConfig,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolsConfig {
    pub hccontrol: String,
    pub service: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Covers the ~10 s inquiry window plus scheduling slack.
    pub scan_secs: u64,
    pub reload_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/bt-tui.sock"),
            hci_node: "ubt0hci".to_string(),
            hcsecd_conf: PathBuf::from("/etc/bluetooth/hcsecd.conf"),
            tools: ToolsConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            hccontrol: "hccontrol".to_string(),
            service: "service".to_string(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            scan_secs: 30,
            reload_secs: 15,
        }
    }
}

impl DaemonConfig {
    /// Loads the config file, falling back to defaults when it does not
    /// exist. The file is never created.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content)
                .with_context(|| format!("invalid config file {}", path.display())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hci_node.trim().is_empty() {
            bail!("hci_node must not be empty");
        }
        if self.socket_path.as_os_str().is_empty() {
            bail!("socket_path must not be empty");
        }
        if self.tools.hccontrol.is_empty() || self.tools.service.is_empty() {
            bail!("tool paths must not be empty");
        }
        if self.timeouts.scan_secs == 0 || self.timeouts.reload_secs == 0 {
            bail!("timeouts must be greater than zero");
        }
        Ok(())
    }
}
