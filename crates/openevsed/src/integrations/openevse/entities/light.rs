use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use serde_json::json;

use super::Entity;
use super::EntityContext;
use super::Rendered;
use super::View;
use super::base_attributes;
use super::on_off;
use crate::engine::EntityCommand;
use crate::engine::EntityInfo;
use crate::engine::Platform;
use crate::engine::RequestError;
use crate::integrations::openevse::charger::Charger;
use crate::integrations::openevse::coordinator::Snapshot;
use crate::integrations::openevse::descriptions::EntityDescription;

/// Brightness used when turned on without one.
pub const DEFAULT_BRIGHTNESS: u8 = 125;

/// The status LED, dimmable only.
pub struct Light {
    info: EntityInfo,
    description: &'static EntityDescription,
    charger: Arc<dyn Charger>,
}

impl Light {
    pub fn new(ctx: &EntityContext, description: &'static EntityDescription) -> Self {
        Self {
            info: ctx.info(
                Platform::Light,
                description.name,
                format!("{}_{}", description.name, ctx.entry_id),
            ),
            description,
            charger: ctx.charger.clone(),
        }
    }
}

#[async_trait]
impl Entity for Light {
    fn info(&self) -> &EntityInfo {
        &self.info
    }

    fn render(&self, view: &View<'_>) -> Rendered {
        let mut attributes = base_attributes(&self.info, self.description);
        attributes.insert("color_mode".to_string(), Value::from("brightness"));
        attributes.insert("supported_color_modes".to_string(), json!(["brightness"]));

        match view.snapshot.get_i64(self.description.attribute.key()) {
            Some(brightness) if view.available(self.description) => {
                attributes.insert("brightness".to_string(), Value::from(brightness));
                Rendered::new(on_off(brightness != 0), attributes)
            }
            _ => Rendered::unavailable(attributes),
        }
    }

    async fn handle(&self, command: EntityCommand, _snapshot: &Snapshot) -> Result<(), RequestError> {
        let level = match command {
            EntityCommand::TurnOn { brightness } => brightness.unwrap_or(DEFAULT_BRIGHTNESS),
            EntityCommand::TurnOff => 0,
            other => {
                return Err(RequestError::Invalid(format!(
                    "{} does not support {:?}",
                    self.info.entity_id, other
                )));
            }
        };

        self.charger
            .set_led_brightness(level)
            .await
            .map_err(|e| RequestError::Failed(e.to_string()))
    }
}
