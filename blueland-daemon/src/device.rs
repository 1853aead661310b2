/*!
 * Device Cache
 * Session-scoped table of known devices, owned by the coordinator
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::BtError;

/// Hardware address in canonical upper-case colon-hex form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Object path segment BlueZ uses for this device, e.g. `dev_AA_BB_CC_DD_EE_FF`.
    pub fn path_segment(&self) -> String {
        format!("dev_{}", self.0.replace(':', "_"))
    }
}

impl FromStr for Address {
    type Err = BtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let groups: Vec<&str> = s.trim().split(':').collect();
        let valid = groups.len() == 6
            && groups
                .iter()
                .all(|g| g.len() == 2 && g.chars().all(|c| c.is_ascii_hexdigit()));
        if !valid {
            return Err(BtError::InvalidAddress(s.to_string()));
        }
        Ok(Address(groups.join(":").to_ascii_uppercase()))
    }
}

impl TryFrom<String> for Address {
    type Error = BtError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub address: Address,
    pub name: Option<String>,
    pub icon: Option<String>,
    pub discovered: bool,
    pub paired: bool,
    pub trusted: bool,
    /// Only true while the link is up *and* the device is paired.
    pub connected: bool,
    pub rssi: Option<i16>,
    pub uuids: Vec<String>,
    pub last_seen: DateTime<Utc>,
    pub pending_authentication: bool,
    /// Raw link state as reported by the stack.
    #[serde(skip)]
    link_up: bool,
}

impl Device {
    fn new(address: Address) -> Self {
        Self {
            address,
            name: None,
            icon: None,
            discovered: false,
            paired: false,
            trusted: false,
            connected: false,
            rssi: None,
            uuids: Vec::new(),
            last_seen: Utc::now(),
            pending_authentication: false,
            link_up: false,
        }
    }

    /// Name for prompts and logs, falling back to the address.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{} ({})", name, self.address),
            None => self.address.to_string(),
        }
    }

    fn merge(&mut self, update: DeviceUpdate) {
        if let Some(name) = update.name {
            self.name = Some(name);
        }
        if let Some(icon) = update.icon {
            self.icon = Some(icon);
        }
        if let Some(discovered) = update.discovered {
            self.discovered = discovered;
        }
        if let Some(paired) = update.paired {
            self.paired = paired;
        }
        if let Some(trusted) = update.trusted {
            self.trusted = trusted;
        }
        if let Some(connected) = update.connected {
            self.link_up = connected;
        }
        if let Some(rssi) = update.rssi {
            self.rssi = Some(rssi);
        }
        if let Some(uuids) = update.uuids {
            self.uuids = uuids;
        }
        if let Some(pending) = update.pending_authentication {
            self.pending_authentication = pending;
        }
        self.connected = self.link_up && self.paired;
    }

    /// Equality over what subscribers can see.
    fn same_view(&self, other: &Device) -> bool {
        self.address == other.address
            && self.name == other.name
            && self.icon == other.icon
            && self.discovered == other.discovered
            && self.paired == other.paired
            && self.trusted == other.trusted
            && self.connected == other.connected
            && self.rssi == other.rssi
            && self.uuids == other.uuids
            && self.pending_authentication == other.pending_authentication
    }
}

/// Partial device state; `None` fields leave the cached value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceUpdate {
    pub name: Option<String>,
    pub icon: Option<String>,
    pub discovered: Option<bool>,
    pub paired: Option<bool>,
    pub trusted: Option<bool>,
    pub connected: Option<bool>,
    pub rssi: Option<i16>,
    pub uuids: Option<Vec<String>>,
    pub pending_authentication: Option<bool>,
}

#[derive(Debug, Default)]
pub struct DeviceCache {
    devices: HashMap<Address, Device>,
    // discovery order, keeps list() stable for the session
    order: Vec<Address>,
}

impl DeviceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `update` into the entry for `address`, creating it if unseen.
    /// Returns whether the visible state changed.
    pub fn upsert(&mut self, address: &Address, update: DeviceUpdate) -> bool {
        match self.devices.get_mut(address) {
            Some(device) => {
                let before = device.clone();
                device.merge(update);
                let changed = !before.same_view(device);
                if changed {
                    device.last_seen = Utc::now();
                }
                changed
            }
            None => {
                let mut device = Device::new(address.clone());
                device.merge(update);
                self.devices.insert(address.clone(), device);
                self.order.push(address.clone());
                true
            }
        }
    }

    pub fn get(&self, address: &Address) -> Option<&Device> {
        self.devices.get(address)
    }

    pub fn list(&self) -> Vec<Device> {
        self.order
            .iter()
            .filter_map(|address| self.devices.get(address))
            .cloned()
            .collect()
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.order.clone()
    }

    pub fn remove(&mut self, address: &Address) -> bool {
        if self.devices.remove(address).is_some() {
            self.order.retain(|a| a != address);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[test]
    fn parses_and_canonicalizes_addresses() {
        let a = addr("aa:bb:cc:dd:ee:ff");
        assert_eq!(a.as_str(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(a, addr("AA:BB:CC:DD:EE:FF"));
        assert_eq!(a.path_segment(), "dev_AA_BB_CC_DD_EE_FF");
    }

    #[test]
    fn rejects_malformed_addresses() {
        for bad in ["", "AA:BB:CC:DD:EE", "AA:BB:CC:DD:EE:FG", "AABBCCDDEEFF", "AA-BB-CC-DD-EE-FF", "AAA:BB:CC:DD:EE:F"] {
            assert!(matches!(bad.parse::<Address>(), Err(BtError::InvalidAddress(_))), "{bad}");
        }
    }

    #[test]
    fn upsert_merges_without_clobbering() {
        let mut cache = DeviceCache::new();
        let a = addr("AA:BB:CC:DD:EE:FF");
        assert!(cache.upsert(
            &a,
            DeviceUpdate { name: Some("Headphones".into()), discovered: Some(true), ..Default::default() }
        ));
        assert!(cache.upsert(&a, DeviceUpdate { paired: Some(true), ..Default::default() }));

        let device = cache.get(&a).unwrap();
        assert_eq!(device.name.as_deref(), Some("Headphones"));
        assert!(device.discovered);
        assert!(device.paired);
    }

    #[test]
    fn repeated_update_reports_no_change() {
        let mut cache = DeviceCache::new();
        let a = addr("AA:BB:CC:DD:EE:FF");
        let update = DeviceUpdate { trusted: Some(true), ..Default::default() };
        assert!(cache.upsert(&a, update.clone()));
        let seen = cache.get(&a).unwrap().last_seen;
        assert!(!cache.upsert(&a, update));
        assert_eq!(cache.get(&a).unwrap().last_seen, seen);
    }

    #[test]
    fn connected_requires_paired() {
        let mut cache = DeviceCache::new();
        let a = addr("AA:BB:CC:DD:EE:FF");
        cache.upsert(&a, DeviceUpdate { connected: Some(true), ..Default::default() });
        assert!(!cache.get(&a).unwrap().connected);

        // link came up before pairing finished; it shows once paired
        assert!(cache.upsert(&a, DeviceUpdate { paired: Some(true), ..Default::default() }));
        assert!(cache.get(&a).unwrap().connected);
    }

    #[test]
    fn list_keeps_discovery_order() {
        let mut cache = DeviceCache::new();
        let first = addr("22:00:00:00:00:00");
        let second = addr("11:00:00:00:00:00");
        cache.upsert(&first, DeviceUpdate::default());
        cache.upsert(&second, DeviceUpdate::default());
        cache.upsert(&first, DeviceUpdate { paired: Some(true), ..Default::default() });

        let order: Vec<_> = cache.list().into_iter().map(|d| d.address).collect();
        assert_eq!(order, vec![first.clone(), second.clone()]);

        assert!(cache.remove(&first));
        assert!(!cache.remove(&first));
        assert_eq!(cache.list().len(), 1);
        assert!(cache.get(&first).is_none());
    }
}
