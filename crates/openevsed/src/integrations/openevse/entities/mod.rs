//! Entity platforms.
//!
//! Entities hold no state of their own beyond their metadata; every render
//! reads the coordinator snapshot handed to it. Writes go straight to the
//! charger and are logged rather than surfaced when the charger rejects them.

mod binary_sensor;
mod button;
mod light;
mod number;
mod select;
mod sensor;
mod switch;
mod update;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Map;
use serde_json::Value;
use tracing::error;
use tracing::warn;

use super::charger::Charger;
use super::command::CommandError;
use super::coordinator::Snapshot;
use super::descriptions;
use super::descriptions::EntityDescription;
use super::firmware::FirmwareState;
use crate::engine::EntityCommand;
use crate::engine::EntityInfo;
use crate::engine::Platform;
use crate::engine::RequestError;
use crate::engine::state::STATE_OFF;
use crate::engine::state::STATE_ON;
use crate::engine::state::STATE_UNAVAILABLE;
use crate::engine::state::STATE_UNKNOWN;

pub use binary_sensor::BinarySensor;
pub use button::Button;
pub use light::Light;
pub use number::Number;
pub use select::Select;
pub use sensor::Sensor;
pub use switch::Switch;
pub use update::Update;

/// Everything an entity may look at while rendering.
pub struct View<'a> {
    pub snapshot: &'a Snapshot,
    pub firmware: &'a FirmwareState,
    pub charger: &'a dyn Charger,
}

impl View<'_> {
    pub fn version_ok(&self, min_version: Option<&str>) -> bool {
        min_version.is_none_or(|min| self.charger.version_check(min))
    }

    /// Last poll succeeded, the value is cached and the firmware is new enough.
    pub fn available(&self, description: &EntityDescription) -> bool {
        self.snapshot.last_update_success
            && self.snapshot.get(description.attribute.key()).is_some()
            && self.version_ok(description.min_version)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub state: String,
    pub attributes: Map<String, Value>,
}

impl Rendered {
    pub fn new(state: impl Into<String>, attributes: Map<String, Value>) -> Self {
        Self {
            state: state.into(),
            attributes,
        }
    }

    pub fn unavailable(attributes: Map<String, Value>) -> Self {
        Self::new(STATE_UNAVAILABLE, attributes)
    }
}

#[async_trait]
pub trait Entity: Send + Sync {
    fn info(&self) -> &EntityInfo;

    fn render(&self, view: &View<'_>) -> Rendered;

    /// Perform a command. `snapshot` is the cache at the time of the call.
    async fn handle(
        &self,
        command: EntityCommand,
        _snapshot: &Snapshot,
    ) -> Result<(), RequestError> {
        Err(RequestError::Invalid(format!(
            "{} does not support {:?}",
            self.info().entity_id,
            command
        )))
    }
}

/// Per-entry facts every entity is built from.
#[derive(Clone)]
pub struct EntityContext {
    pub entry_id: String,
    /// Display name of the charger
    pub name: String,
    pub device_id: String,
    pub charger: Arc<dyn Charger>,
}

impl EntityContext {
    pub fn info(&self, platform: Platform, name: &str, unique_id: String) -> EntityInfo {
        let friendly = format!("{} {}", self.name, name);
        EntityInfo {
            entity_id: entity_id(platform, &friendly),
            platform,
            name: friendly,
            unique_id,
            device_id: Some(self.device_id.clone()),
            config_entry_id: Some(self.entry_id.clone()),
        }
    }
}

/// `{platform}.{slugified name}` with underscores.
pub fn entity_id(platform: Platform, name: &str) -> String {
    format!("{}.{}", platform, slug::slugify(name).replace('-', "_"))
}

/// Attributes common to every entity of a description.
fn base_attributes(info: &EntityInfo, description: &EntityDescription) -> Map<String, Value> {
    let mut attributes = Map::new();
    attributes.insert("friendly_name".to_string(), Value::from(info.name.clone()));
    if let Some(icon) = description.icon {
        attributes.insert("icon".to_string(), Value::from(icon));
    }
    if let Some(class) = description.device_class {
        attributes.insert("device_class".to_string(), Value::from(class));
    }
    if let Some(category) = description.entity_category {
        attributes.insert(
            "entity_category".to_string(),
            Value::from(category.as_ref()),
        );
    }
    attributes
}

/// State string for a cached value.
fn state_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => STATE_UNKNOWN.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(true)) => STATE_ON.to_string(),
        Some(Value::Bool(false)) => STATE_OFF.to_string(),
        Some(other) => other.to_string(),
    }
}

fn on_off(on: bool) -> &'static str {
    if on { STATE_ON } else { STATE_OFF }
}

/// Log a write the charger refused. Only transport failures reach the caller.
fn report_write(
    name: &str,
    value: &str,
    result: Result<(), CommandError>,
) -> Result<(), RequestError> {
    match result {
        Ok(()) => Ok(()),
        Err(CommandError::InvalidValue(command)) => {
            error!("Value {} invalid for command {}.", value, command);
            Ok(())
        }
        Err(CommandError::CommandFailed(command)) => {
            error!("Command {} failed.", command);
            Ok(())
        }
        Err(CommandError::Client(err)) if err.is_read_suppressible() => {
            warn!("Could not set status for {} error: {}", name, err);
            Ok(())
        }
        Err(CommandError::Client(err @ openevse_http::ClientError::OutOfRange { .. })) => {
            Err(RequestError::Invalid(err.to_string()))
        }
        Err(CommandError::Client(err)) => Err(RequestError::Failed(err.to_string())),
    }
}

/// Build every entity for one entry. The light is only created when the
/// gateway reports a brightness.
pub fn build(ctx: &EntityContext, snapshot: &Snapshot) -> Vec<Arc<dyn Entity>> {
    let mut entities: Vec<Arc<dyn Entity>> = Vec::new();
    for d in descriptions::SENSORS {
        entities.push(Arc::new(Sensor::new(ctx, d)));
    }
    for d in descriptions::BINARY_SENSORS {
        entities.push(Arc::new(BinarySensor::new(ctx, d)));
    }
    for d in descriptions::SWITCHES {
        entities.push(Arc::new(Switch::new(ctx, d)));
    }
    for d in descriptions::SELECTS {
        entities.push(Arc::new(Select::new(ctx, d)));
    }
    for d in descriptions::NUMBERS {
        entities.push(Arc::new(Number::new(ctx, d)));
    }
    for d in descriptions::LIGHTS {
        if snapshot.data.contains_key(d.attribute.key()) {
            entities.push(Arc::new(Light::new(ctx, d)));
        }
    }
    for d in descriptions::BUTTONS {
        entities.push(Arc::new(Button::new(ctx, d)));
    }
    entities.push(Arc::new(Update::new(ctx)));
    entities
}
