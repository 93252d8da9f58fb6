use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use dashmap::DashMap;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;

/// A `(domain, id)` pair uniquely naming a physical device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceIdentifier(pub String, pub String);

impl DeviceIdentifier {
    pub fn new(domain: impl Into<String>, id: impl Into<String>) -> Self {
        Self(domain.into(), id.into())
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.0, self.1)
    }
}

/// A `(type, id)` pair describing how a device is reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceConnection(pub String, pub String);

impl DeviceConnection {
    pub fn new(conn_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self(conn_type.into(), id.into())
    }

    pub fn connection_type(&self) -> &str {
        &self.0
    }

    pub fn id(&self) -> &str {
        &self.1
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.0, self.1)
    }
}

/// What an integration knows about a device when registering it.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub identifiers: Vec<DeviceIdentifier>,
    pub connections: Vec<DeviceConnection>,
    pub name: String,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub sw_version: Option<String>,
    pub configuration_url: Option<String>,
}

/// A registered device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceEntry {
    pub id: String,
    pub config_entries: BTreeSet<String>,
    pub identifiers: BTreeSet<DeviceIdentifier>,
    /// Kept in registration order; the first connection names the owning entry
    pub connections: Vec<DeviceConnection>,
    pub name: String,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub sw_version: Option<String>,
    pub configuration_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Device registry with identifier and connection indexes.
#[derive(Default)]
pub struct DeviceRegistry {
    by_id: DashMap<String, Arc<DeviceEntry>>,
    by_identifier: DashMap<String, String>,
    by_connection: DashMap<String, String>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        self.by_id.get(device_id).map(|r| Arc::clone(r.value()))
    }

    pub fn get_by_identifier(&self, identifier: &DeviceIdentifier) -> Option<Arc<DeviceEntry>> {
        self.by_identifier
            .get(&identifier.key())
            .and_then(|id| self.get(id.value()))
    }

    pub fn get_by_connection(&self, connection: &DeviceConnection) -> Option<Arc<DeviceEntry>> {
        self.by_connection
            .get(&connection.key())
            .and_then(|id| self.get(id.value()))
    }

    pub fn get_by_config_entry_id(&self, config_entry_id: &str) -> Vec<Arc<DeviceEntry>> {
        self.by_id
            .iter()
            .filter(|r| r.value().config_entries.contains(config_entry_id))
            .map(|r| Arc::clone(r.value()))
            .collect()
    }

    /// All devices, oldest first.
    pub fn all(&self) -> Vec<Arc<DeviceEntry>> {
        let mut devices: Vec<_> = self.by_id.iter().map(|r| Arc::clone(r.value())).collect();
        devices.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        devices
    }

    /// Find a device by any identifier or connection, refreshing its metadata,
    /// or create a new one.
    pub fn get_or_create(&self, config_entry_id: &str, info: DeviceInfo) -> Arc<DeviceEntry> {
        let existing = info
            .identifiers
            .iter()
            .find_map(|i| self.get_by_identifier(i))
            .or_else(|| info.connections.iter().find_map(|c| self.get_by_connection(c)));

        let now = Utc::now();
        let entry = match existing {
            Some(existing) => {
                debug!("Found existing device {} for {}", existing.id, info.name);
                let mut entry = DeviceEntry::clone(&existing);
                entry.config_entries.insert(config_entry_id.to_string());
                entry.identifiers.extend(info.identifiers);
                for connection in info.connections {
                    if !entry.connections.contains(&connection) {
                        entry.connections.push(connection);
                    }
                }
                entry.name = info.name;
                entry.manufacturer = info.manufacturer.or(entry.manufacturer);
                entry.model = info.model.or(entry.model);
                entry.sw_version = info.sw_version.or(entry.sw_version);
                entry.configuration_url = info.configuration_url.or(entry.configuration_url);
                entry.modified_at = now;
                entry
            }
            None => {
                let entry = DeviceEntry {
                    id: uuid::Uuid::new_v4().simple().to_string(),
                    config_entries: BTreeSet::from([config_entry_id.to_string()]),
                    identifiers: info.identifiers.into_iter().collect(),
                    connections: info.connections,
                    name: info.name,
                    manufacturer: info.manufacturer,
                    model: info.model,
                    sw_version: info.sw_version,
                    configuration_url: info.configuration_url,
                    created_at: now,
                    modified_at: now,
                };
                info!("Registered device {} ({})", entry.name, entry.id);
                entry
            }
        };

        let entry = Arc::new(entry);
        self.index(&entry);
        entry
    }

    /// Detach a config entry from its devices, removing devices left with none.
    /// Returns the ids of removed devices.
    pub fn remove_config_entry(&self, config_entry_id: &str) -> Vec<String> {
        let mut removed = Vec::new();
        for device in self.get_by_config_entry_id(config_entry_id) {
            if device.config_entries.len() <= 1 {
                self.remove(&device.id);
                removed.push(device.id.clone());
            } else {
                let mut entry = DeviceEntry::clone(&device);
                entry.config_entries.remove(config_entry_id);
                entry.modified_at = Utc::now();
                self.index(&Arc::new(entry));
            }
        }
        removed
    }

    pub fn remove(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        let (_, entry) = self.by_id.remove(device_id)?;
        for identifier in &entry.identifiers {
            self.by_identifier.remove(&identifier.key());
        }
        for connection in &entry.connections {
            self.by_connection.remove(&connection.key());
        }
        info!("Removed device {} ({})", entry.name, entry.id);
        Some(entry)
    }

    fn index(&self, entry: &Arc<DeviceEntry>) {
        for identifier in &entry.identifiers {
            self.by_identifier.insert(identifier.key(), entry.id.clone());
        }
        for connection in &entry.connections {
            self.by_connection.insert(connection.key(), entry.id.clone());
        }
        self.by_id.insert(entry.id.clone(), Arc::clone(entry));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn charger(serial: &str, entry_id: &str) -> DeviceInfo {
        DeviceInfo {
            identifiers: vec![DeviceIdentifier::new("openevse", serial)],
            connections: vec![DeviceConnection::new("openevse", entry_id)],
            name: "openevse".to_string(),
            manufacturer: Some("OpenEVSE".to_string()),
            model: Some("openevse_wifi_v1".to_string()),
            sw_version: Some("4.1.2".to_string()),
            configuration_url: Some("http://openevse.test.tld/".to_string()),
        }
    }

    #[test]
    fn test_get_or_create_is_stable() {
        let registry = DeviceRegistry::new();
        let first = registry.get_or_create("entry1", charger("abc", "entry1"));

        let mut refreshed = charger("abc", "entry1");
        refreshed.sw_version = Some("4.1.7".to_string());
        let second = registry.get_or_create("entry1", refreshed);

        assert_eq!(first.id, second.id);
        assert_eq!(second.sw_version.as_deref(), Some("4.1.7"));
        assert_eq!(registry.all().len(), 1);
        assert_eq!(
            registry
                .get_by_connection(&DeviceConnection::new("openevse", "entry1"))
                .map(|d| d.id.clone()),
            Some(first.id.clone())
        );
    }

    #[test]
    fn test_match_by_connection() {
        let registry = DeviceRegistry::new();
        let first = registry.get_or_create("entry1", charger("abc", "entry1"));
        // Serial changed but the connection still identifies the device
        let second = registry.get_or_create("entry1", charger("def", "entry1"));

        assert_eq!(first.id, second.id);
        assert_eq!(second.identifiers.len(), 2);
    }

    #[test]
    fn test_remove_config_entry() {
        let registry = DeviceRegistry::new();
        let device = registry.get_or_create("entry1", charger("abc", "entry1"));
        registry.get_or_create("entry2", charger("xyz", "entry2"));

        let removed = registry.remove_config_entry("entry1");
        assert_eq!(removed, vec![device.id.clone()]);
        assert!(registry.get(&device.id).is_none());
        assert!(registry
            .get_by_identifier(&DeviceIdentifier::new("openevse", "abc"))
            .is_none());
        assert_eq!(registry.all().len(), 1);
    }

    #[test]
    fn test_shared_device_survives_partial_removal() {
        let registry = DeviceRegistry::new();
        let device = registry.get_or_create("entry1", charger("abc", "entry1"));
        registry.get_or_create("entry2", charger("abc", "entry2"));

        assert!(registry.remove_config_entry("entry1").is_empty());
        let remaining = registry.get(&device.id).unwrap();
        assert_eq!(
            remaining.config_entries,
            BTreeSet::from(["entry2".to_string()])
        );
    }
}
