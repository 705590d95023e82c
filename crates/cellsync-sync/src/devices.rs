//! # Device Registry
//!
//! Devices that have announced themselves to this engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;

use cellsync_core::DeviceType;

/// A device known to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_type: DeviceType,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl DeviceInfo {
    pub fn new(device_id: impl Into<String>, device_type: DeviceType) -> Self {
        let now = Utc::now();
        DeviceInfo {
            device_id: device_id.into(),
            device_type,
            name: None,
            user_agent: None,
            registered_at: now,
            last_activity: now,
        }
    }

    /// Device whose type is guessed from its browser user agent.
    pub fn from_user_agent(device_id: impl Into<String>, user_agent: impl Into<String>) -> Self {
        let user_agent = user_agent.into();
        let mut info = Self::new(device_id, DeviceType::from_user_agent(&user_agent));
        info.user_agent = Some(user_agent);
        info
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Known devices keyed by id.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<BTreeMap<String, DeviceInfo>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or refreshes a device and returns the stored entry.
    ///
    /// A device registering again keeps its original `registered_at`.
    pub fn register(&self, mut info: DeviceInfo) -> DeviceInfo {
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = devices.get(&info.device_id) {
            info.registered_at = existing.registered_at;
        }
        info.last_activity = Utc::now();
        devices.insert(info.device_id.clone(), info.clone());
        info
    }

    /// Records activity of a known device. Returns `false` if unknown.
    pub fn touch(&self, device_id: &str, at: DateTime<Utc>) -> bool {
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        match devices.get_mut(device_id) {
            Some(info) => {
                info.last_activity = at;
                true
            }
            None => false,
        }
    }

    /// Every known device, ordered by id.
    pub fn list(&self) -> Vec<DeviceInfo> {
        self.devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}
