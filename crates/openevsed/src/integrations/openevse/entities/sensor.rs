use async_trait::async_trait;
use serde_json::Value;

use super::Entity;
use super::EntityContext;
use super::Rendered;
use super::View;
use super::base_attributes;
use super::state_text;
use crate::engine::EntityInfo;
use crate::engine::Platform;
use crate::integrations::openevse::accessor::Attribute;
use crate::integrations::openevse::descriptions::SensorDescription;
use crate::integrations::openevse::descriptions::status_icon;

pub struct Sensor {
    info: EntityInfo,
    description: &'static SensorDescription,
}

impl Sensor {
    pub fn new(ctx: &EntityContext, description: &'static SensorDescription) -> Self {
        let base = &description.base;
        Self {
            info: ctx.info(
                Platform::Sensor,
                base.name,
                format!("{}_{}", base.name, ctx.entry_id),
            ),
            description,
        }
    }
}

#[async_trait]
impl Entity for Sensor {
    fn info(&self) -> &EntityInfo {
        &self.info
    }

    fn render(&self, view: &View<'_>) -> Rendered {
        let base = &self.description.base;
        let mut attributes = base_attributes(&self.info, base);
        if let Some(unit) = self.description.unit {
            attributes.insert("unit_of_measurement".to_string(), Value::from(unit));
        }
        if let Some(class) = self.description.state_class {
            attributes.insert("state_class".to_string(), Value::from(class));
        }
        if let Some(precision) = self.description.display_precision {
            attributes.insert(
                "suggested_display_precision".to_string(),
                Value::from(precision),
            );
        }

        if !view.available(base) {
            return Rendered::unavailable(attributes);
        }

        let value = view.snapshot.get(base.attribute.key());
        let state = state_text(value);
        if base.attribute == Attribute::State {
            attributes.insert("icon".to_string(), Value::from(status_icon(&state)));
        }
        Rendered::new(state, attributes)
    }
}
