/*!
 * Bluetooth Device Management
 * Discovery via hccontrol, pairing via hcsecd.conf
 */

pub mod hcsecd;
pub mod inquiry;

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::config::DaemonConfig;
use crate::process::{CommandRunner, InvokeError};
use hcsecd::{HcsecdConfig, HcsecdError, PairingEntry, UpsertOutcome};

/// Longest PIN accepted by legacy Bluetooth pairing, in bytes.
pub const MAX_PIN_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid Bluetooth address: {0:?}")]
    Address(String),

    #[error("Missing {0}")]
    Missing(&'static str),

    #[error("PIN must not be empty")]
    EmptyPin,

    #[error("PIN must be at most {MAX_PIN_LEN} bytes")]
    PinTooLong,

    #[error("{field} contains forbidden character {ch:?}")]
    ForbiddenChar { field: &'static str, ch: char },
}

/// 48-bit Bluetooth device address.
///
/// Parses from six colon-separated hex octets in any letter case and always
/// renders lowercase, the way hccontrol prints it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BdAddr([u8; 6]);

impl FromStr for BdAddr {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::Address(s.to_string());
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');

        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }

        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl Serialize for BdAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BdAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// PIN that is safe to embed in a quoted hcsecd.conf value.
#[derive(Clone, PartialEq, Eq)]
pub struct Pin(String);

impl Pin {
    pub fn new(raw: &str) -> Result<Self, ValidationError> {
        if raw.is_empty() {
            return Err(ValidationError::EmptyPin);
        }
        if raw.len() > MAX_PIN_LEN {
            return Err(ValidationError::PinTooLong);
        }
        check_config_value("PIN", raw)?;
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Keep secrets out of logs.
impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pin(****)")
    }
}

/// Device name as stored in hcsecd.conf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceName(String);

impl DeviceName {
    pub fn new(raw: &str) -> Result<Self, ValidationError> {
        check_config_value("Name", raw)?;
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Rejects characters that would break out of a quoted hcsecd.conf value
/// or split the record.
fn check_config_value(field: &'static str, raw: &str) -> Result<(), ValidationError> {
    match raw
        .chars()
        .find(|ch| ch.is_control() || matches!(ch, '"' | '\\' | ';' | '{' | '}' | '#'))
    {
        Some(ch) => Err(ValidationError::ForbiddenChar { field, ch }),
        None => Ok(()),
    }
}

/// A device seen by the most recent inquiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub address: BdAddr,
    pub name: Option<String>,
    pub paired: bool,
}

impl Device {
    pub fn discovered(address: BdAddr) -> Self {
        Self {
            address,
            name: None,
            paired: false,
        }
    }
}

/// Failure of the pair sequence. `Reload` means the entry is already on disk.
#[derive(Debug, Error)]
pub enum PairError {
    #[error(transparent)]
    Config(#[from] HcsecdError),

    #[error("hcsecd reload failed: {0}")]
    Reload(#[source] InvokeError),
}

pub struct BluetoothManager<R> {
    runner: R,
    hci_node: String,
    hccontrol: String,
    service: String,
    scan_timeout: Duration,
    reload_timeout: Duration,
    hcsecd: HcsecdConfig,
}

impl<R: CommandRunner> BluetoothManager<R> {
    pub fn new(runner: R, config: &DaemonConfig) -> Self {
        Self {
            runner,
            hci_node: config.hci_node.clone(),
            hccontrol: config.tools.hccontrol.clone(),
            service: config.tools.service.clone(),
            scan_timeout: Duration::from_secs(config.timeouts.scan_secs),
            reload_timeout: Duration::from_secs(config.timeouts.reload_secs),
            hcsecd: HcsecdConfig::new(config.hcsecd_conf.clone()),
        }
    }

    #[cfg(test)]
    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn hci_node(&self) -> &str {
        &self.hci_node
    }

    pub fn hcsecd_path(&self) -> &PathBuf {
        self.hcsecd.path()
    }

    /// Runs an inquiry on the configured HCI node and returns the devices
    /// that answered, in first-seen order. Paired flags are not set here.
    pub async fn scan_devices(&self) -> Result<Vec<Device>, InvokeError> {
        tracing::info!(node = %self.hci_node, "Starting inquiry");
        let args = vec![
            "-n".to_string(),
            self.hci_node.clone(),
            "inquiry".to_string(),
        ];
        let output = self
            .runner
            .run(&self.hccontrol, &args, self.scan_timeout)
            .await?;
        Ok(inquiry::parse_inquiry(&output.stdout))
    }

    pub fn paired_addresses(&self) -> Result<HashSet<BdAddr>, HcsecdError> {
        self.hcsecd.paired_addresses()
    }

    /// Writes the pairing entry, then restarts hcsecd so it picks it up.
    pub async fn pair_device(&self, entry: &PairingEntry) -> Result<UpsertOutcome, PairError> {
        tracing::info!(device = %entry.address, "Pairing with device");
        let outcome = self.hcsecd.upsert(entry)?;
        self.reload_security_service()
            .await
            .map_err(PairError::Reload)?;
        Ok(outcome)
    }

    async fn reload_security_service(&self) -> Result<(), InvokeError> {
        tracing::info!("Restarting hcsecd service");
        let args = vec!["hcsecd".to_string(), "restart".to_string()];
        self.runner
            .run(&self.service, &args, self.reload_timeout)
            .await?;
        tracing::info!("hcsecd restarted");
        Ok(())
    }
}
