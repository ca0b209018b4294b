//! Bridge configuration: broker endpoint, CAN interface and the device list
//! with per-output entity metadata. Loaded once at startup; validation
//! failures are fatal and reported together.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct BridgeConfig {
    pub mqtt: MqttConfig,
    pub can: CanConfig,
    pub state_file: Option<PathBuf>,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub discovery_prefix: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: "scheiber2mqtt".to_string(),
            discovery_prefix: "homeassistant".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CanConfig {
    pub interface: String,
    pub read_only: bool,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            interface: "can0".to_string(),
            read_only: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeviceConfig {
    pub device_type: String,
    pub device_id: u8,
    /// Slot name ("s1".."s6") to entity. Unconfigured slots stay silent.
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OutputConfig {
    pub kind: OutputKind,
    pub entity_id: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Light,
    Switch,
}

/// Zero-based slot for a one-indexed UI label.
pub fn slot_index(name: &str) -> Option<usize> {
    match name {
        "s1" => Some(0),
        "s2" => Some(1),
        "s3" => Some(2),
        "s4" => Some(3),
        "s5" => Some(4),
        "s6" => Some(5),
        _ => None,
    }
}

pub fn load_config(path: &Path) -> Result<BridgeConfig, BridgeError> {
    let data = fs::read_to_string(path).map_err(|e| {
        BridgeError::ConfigInvalid(format!("cannot read {}: {e}", path.display()))
    })?;
    let config: BridgeConfig = serde_json::from_str(&data).map_err(|e| {
        BridgeError::ConfigInvalid(format!("cannot parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

impl BridgeConfig {
    pub fn state_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(crate::state::default_state_path)
    }

    /// Check everything that must hold before devices are built. All
    /// problems are collected into one fatal error so a broken config is
    /// fixed in one pass.
    pub fn validate(&self) -> Result<(), BridgeError> {
        let mut problems = Vec::new();
        let mut entity_ids = HashSet::new();

        if self.devices.is_empty() {
            problems.push("no devices configured".to_string());
        }

        for dev in &self.devices {
            if dev.device_type != "bloc9" {
                problems.push(format!("unknown device type '{}'", dev.device_type));
            }
            if !(1..=10).contains(&dev.device_id) {
                problems.push(format!("device id {} outside 1..=10", dev.device_id));
            }
            for (slot, out) in &dev.outputs {
                if slot_index(slot).is_none() {
                    problems.push(format!(
                        "device {}: invalid slot '{slot}' (expected s1..s6)",
                        dev.device_id
                    ));
                }
                if out.entity_id.is_empty() {
                    problems.push(format!(
                        "device {}: slot {slot} has empty entity_id",
                        dev.device_id
                    ));
                } else if !entity_ids.insert(out.entity_id.clone()) {
                    problems.push(format!("duplicate entity_id '{}'", out.entity_id));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(BridgeError::ConfigInvalid(problems.join("; ")))
        }
    }
}
