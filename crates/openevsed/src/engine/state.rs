use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

pub const STATE_UNAVAILABLE: &str = "unavailable";
pub const STATE_UNKNOWN: &str = "unknown";
pub const STATE_ON: &str = "on";
pub const STATE_OFF: &str = "off";

/// State of a single entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,

    /// Primary state, always a string (numbers are rendered, `on`/`off` for
    /// binary entities, `unavailable` when there is no usable reading).
    pub state: String,

    /// Metadata such as unit, icon and device class.
    #[serde(default)]
    pub attributes: Map<String, Value>,

    pub last_updated: DateTime<Utc>,
}

impl EntityState {
    pub fn new(
        entity_id: impl Into<String>,
        state: impl Into<String>,
        attributes: Map<String, Value>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            state: state.into(),
            attributes,
            last_updated: Utc::now(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.state != STATE_UNAVAILABLE
    }

    /// Same state and attributes, ignoring the timestamp.
    pub fn same_as(&self, other: &EntityState) -> bool {
        self.state == other.state && self.attributes == other.attributes
    }
}

/// Centralized snapshot of every entity's state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct State {
    pub entities: BTreeMap<String, EntityState>,
}

impl State {
    pub fn get(&self, entity_id: &str) -> Option<&EntityState> {
        self.entities.get(entity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_as_ignores_timestamp() {
        let a = EntityState::new("sensor.openevse_current_power", "7200", Map::new());
        let mut b = a.clone();
        b.last_updated = a.last_updated + chrono::Duration::seconds(5);
        assert!(a.same_as(&b));

        b.state = STATE_UNAVAILABLE.to_string();
        assert!(!a.same_as(&b));
        assert!(!b.is_available());
    }
}
