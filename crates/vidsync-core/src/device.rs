//! Registered capture devices (drones, action cams, card readers).
//!
//! The registry is a JSON document maintained by the dashboard; the worker
//! only reads it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    #[default]
    Active,
    Paused,
}

/// Per-device pipeline settings, keyed by filesystem UUID.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceConfig {
    pub uuid: String,
    pub friendly_name: Option<String>,
    /// Folder under the destination root that receives this device's syncs
    pub output_path: Option<String>,
    /// Subfolder of the mounted device that holds footage
    pub source_path: Option<String>,
    pub status: DeviceStatus,
    pub merger_enabled: bool,
    pub dry_run: bool,
    pub delete_after_merge: bool,
    /// Prefix for merged file names
    pub merger_name: Option<String>,
    /// Flight split gap in seconds
    pub merger_time_gap: Option<u64>,
    pub stabilize_after_merge: bool,
    pub delete_after_stabilize: bool,
}

impl DeviceConfig {
    pub fn new(uuid: impl Into<String>) -> Self {
        DeviceConfig {
            uuid: uuid.into(),
            ..Default::default()
        }
    }

    pub fn display_name(&self) -> &str {
        self.friendly_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.uuid)
    }

    /// Folder name under the destination root.
    pub fn out_folder(&self) -> &str {
        self.output_path
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.friendly_name.as_deref().filter(|s| !s.is_empty()))
            .unwrap_or("unknown_device")
    }

    /// Prefix used for merged file names.
    pub fn merge_name(&self) -> &str {
        self.merger_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.out_folder())
    }

    pub fn time_gap_secs(&self, default_secs: u64) -> u64 {
        self.merger_time_gap.unwrap_or(default_secs)
    }

    /// Source subpath relative to the mount point, without leading slashes.
    pub fn source_subpath(&self) -> &str {
        self.source_path
            .as_deref()
            .map(|s| s.trim_start_matches('/'))
            .unwrap_or("")
    }
}

/// Device registry: `{ "devices": [...] }`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceRegistry {
    pub devices: Vec<DeviceConfig>,
}

impl DeviceRegistry {
    /// Load the registry from a JSON file; a missing file is an empty registry.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading device registry: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parsing device registry: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating dir: {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("serializing device registry")?;
        std::fs::write(path, json)
            .with_context(|| format!("writing device registry: {}", path.display()))
    }

    pub fn find(&self, uuid: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.uuid == uuid)
    }

    pub fn active_devices(&self) -> impl Iterator<Item = &DeviceConfig> {
        self.devices
            .iter()
            .filter(|d| d.status == DeviceStatus::Active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dashboard_registry() {
        let json = r#"{
            "devices": [
                {
                    "uuid": "5E4B-1A2C",
                    "friendlyName": "Mavic 3",
                    "outputPath": "mavic",
                    "sourcePath": "/DCIM/100MEDIA",
                    "status": "active",
                    "mergerEnabled": true,
                    "mergerTimeGap": 20,
                    "stabilizeAfterMerge": true
                },
                { "uuid": "0000-FFFF", "status": "paused" }
            ]
        }"#;
        let registry: DeviceRegistry = serde_json::from_str(json).unwrap();

        let mavic = registry.find("5E4B-1A2C").unwrap();
        assert_eq!(mavic.display_name(), "Mavic 3");
        assert_eq!(mavic.out_folder(), "mavic");
        assert_eq!(mavic.merge_name(), "mavic");
        assert_eq!(mavic.source_subpath(), "DCIM/100MEDIA");
        assert_eq!(mavic.time_gap_secs(10), 20);
        assert!(mavic.merger_enabled);
        assert!(!mavic.dry_run);

        assert_eq!(registry.active_devices().count(), 1);
    }

    #[test]
    fn test_out_folder_fallbacks() {
        let mut cfg = DeviceConfig::new("abc");
        assert_eq!(cfg.out_folder(), "unknown_device");
        assert_eq!(cfg.display_name(), "abc");

        cfg.friendly_name = Some("Avata".into());
        assert_eq!(cfg.out_folder(), "Avata");

        cfg.merger_name = Some("avata_flights".into());
        assert_eq!(cfg.merge_name(), "avata_flights");
        assert_eq!(cfg.time_gap_secs(10), 10);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf/devices.json");

        let registry = DeviceRegistry {
            devices: vec![DeviceConfig::new("1111-2222")],
        };
        registry.save(&path).unwrap();

        let loaded = DeviceRegistry::load(&path).unwrap();
        assert_eq!(loaded.devices.len(), 1);
        assert_eq!(loaded.devices[0].uuid, "1111-2222");

        let missing = DeviceRegistry::load(&dir.path().join("nope.json")).unwrap();
        assert!(missing.devices.is_empty());
    }
}
