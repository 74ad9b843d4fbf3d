// Device metadata returned by the device list and the `get` response.
//
// Everything here is a cached snapshot: lookups default to empty values
// and never fail a control operation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One entry of the `lst_device` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device id used in get/set frames.
    pub device: String,

    #[serde(default)]
    pub owner: Option<String>,

    #[serde(default)]
    pub role: Option<String>,

    #[serde(default)]
    pub properties: DeviceProperties,

    /// Remaining fields the relay sends.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceProperties {
    #[serde(default, rename = "displayName")]
    pub display_name: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeviceInfo {
    pub fn display_name(&self) -> Option<&str> {
        self.properties
            .display_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
    }

    /// Parse the device list payload, skipping entries without an id.
    pub fn parse_list(data: Option<&Value>) -> Vec<Self> {
        let Some(Value::Array(entries)) = data else {
            return Vec::new();
        };
        entries
            .iter()
            .filter_map(|entry| match serde_json::from_value::<Self>(entry.clone()) {
                Ok(info) if !info.device.is_empty() => Some(info),
                Ok(_) => None,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping malformed device list entry");
                    None
                }
            })
            .collect()
    }
}

/// Hardware details from `data.profile` of a `get` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceProfile {
    pub model: Option<String>,
    pub brand: Option<String>,
    pub firmware_version: Option<String>,
    pub mac_address: Option<String>,
    pub local_ip: Option<String>,
}

impl DeviceProfile {
    pub fn from_value(profile: &Value) -> Self {
        let text = |section: &str, key: &str| {
            profile
                .get(section)
                .and_then(|s| s.get(key))
                .and_then(Value::as_str)
                .map(String::from)
        };
        Self {
            model: text("esh", "model"),
            brand: text("esh", "brand"),
            firmware_version: text("module", "firmware_version"),
            mac_address: text("module", "mac_address"),
            local_ip: text("module", "local_ip"),
        }
    }
}

/// Devices known to the session, in device-list order.
#[derive(Debug, Clone, Default)]
pub struct DeviceDirectory {
    devices: Vec<DeviceInfo>,
    profiles: HashMap<String, DeviceProfile>,
}

impl DeviceDirectory {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices,
            profiles: HashMap::new(),
        }
    }

    /// Replace the device list, keeping profiles of devices still present.
    pub fn with_devices(&self, devices: Vec<DeviceInfo>) -> Self {
        let profiles = self
            .profiles
            .iter()
            .filter(|(id, _)| devices.iter().any(|d| &d.device == *id))
            .map(|(id, p)| (id.clone(), p.clone()))
            .collect();
        Self { devices, profiles }
    }

    pub fn with_profile(&self, device: &str, profile: DeviceProfile) -> Self {
        let mut next = self.clone();
        next.profiles.insert(device.to_owned(), profile);
        next
    }

    /// The first listed device.
    pub fn default_id(&self) -> Option<&str> {
        self.devices.first().map(|d| d.device.as_str())
    }

    pub fn ids(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.device.clone()).collect()
    }

    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    pub fn metadata(&self, device: &str) -> Option<&DeviceInfo> {
        self.devices.iter().find(|d| d.device == device)
    }

    pub fn profile(&self, device: &str) -> Option<&DeviceProfile> {
        self.profiles.get(device)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_list_and_skips_bad_entries() {
        let data = json!([
            {"device": "dev-123", "owner": "me", "role": "owner",
             "properties": {"displayName": "Bedroom Fan"}},
            {"owner": "nobody"},
            {"device": ""},
            {"device": "dev-456"}
        ]);
        let devices = DeviceInfo::parse_list(Some(&data));
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].display_name(), Some("Bedroom Fan"));
        assert_eq!(devices[1].display_name(), None);
    }

    #[test]
    fn non_list_payload_is_empty() {
        assert!(DeviceInfo::parse_list(Some(&json!({"oops": true}))).is_empty());
        assert!(DeviceInfo::parse_list(None).is_empty());
    }

    #[test]
    fn first_device_is_default() {
        let dir = DeviceDirectory::new(DeviceInfo::parse_list(Some(&json!([
            {"device": "dev-123"}, {"device": "dev-456"}
        ]))));
        assert_eq!(dir.default_id(), Some("dev-123"));
        assert_eq!(dir.ids(), vec!["dev-123", "dev-456"]);
        assert!(dir.metadata("missing").is_none());
    }

    #[test]
    fn profile_fields_are_extracted() {
        let profile = DeviceProfile::from_value(&json!({
            "esh": {"model": "FS-1", "brand": "Fanimation"},
            "module": {"firmware_version": "1.2.3", "mac_address": "aa:bb", "local_ip": "10.0.0.5"}
        }));
        assert_eq!(profile.model.as_deref(), Some("FS-1"));
        assert_eq!(profile.local_ip.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn refreshing_devices_drops_stale_profiles() {
        let dir = DeviceDirectory::new(vec![
            DeviceInfo { device: "a".into(), ..DeviceInfo::default() },
            DeviceInfo { device: "b".into(), ..DeviceInfo::default() },
        ])
        .with_profile("a", DeviceProfile::default())
        .with_profile("b", DeviceProfile::default());

        let next = dir.with_devices(vec![DeviceInfo { device: "b".into(), ..DeviceInfo::default() }]);
        assert!(next.profile("a").is_none());
        assert!(next.profile("b").is_some());
    }
}
