use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::Entity;
use super::EntityContext;
use super::Rendered;
use super::View;
use super::base_attributes;
use super::report_write;
use crate::engine::EntityCommand;
use crate::engine::EntityInfo;
use crate::engine::Platform;
use crate::engine::RequestError;
use crate::integrations::openevse::charger::Charger;
use crate::integrations::openevse::command::set_charge_current;
use crate::integrations::openevse::coordinator::Snapshot;
use crate::integrations::openevse::descriptions::NumberDescription;

pub struct Number {
    info: EntityInfo,
    description: &'static NumberDescription,
    charger: Arc<dyn Charger>,
}

impl Number {
    pub fn new(ctx: &EntityContext, description: &'static NumberDescription) -> Self {
        let name = description.base.name;
        Self {
            info: ctx.info(
                Platform::Number,
                name,
                format!("{}_{}", name, ctx.entry_id),
            ),
            description,
            charger: ctx.charger.clone(),
        }
    }

    /// Bounds reported by the charger, falling back to the static ones.
    fn bounds(&self, snapshot: &Snapshot) -> (f64, f64) {
        let min = snapshot
            .get_i64("min_amps")
            .map(|v| v as f64)
            .unwrap_or(self.description.min);
        let max = snapshot
            .get_i64("max_amps")
            .map(|v| v as f64)
            .unwrap_or(self.description.max);
        (min, max)
    }
}

#[async_trait]
impl Entity for Number {
    fn info(&self) -> &EntityInfo {
        &self.info
    }

    fn render(&self, view: &View<'_>) -> Rendered {
        let (min, max) = self.bounds(view.snapshot);
        let mut attributes = base_attributes(&self.info, &self.description.base);
        attributes.insert("min".to_string(), Value::from(min));
        attributes.insert("max".to_string(), Value::from(max));
        attributes.insert("step".to_string(), Value::from(self.description.step));
        attributes.insert(
            "unit_of_measurement".to_string(),
            Value::from(self.description.unit),
        );
        attributes.insert("mode".to_string(), Value::from("auto"));

        match view.snapshot.get_i64(self.description.base.attribute.key()) {
            Some(value) if view.available(&self.description.base) => {
                Rendered::new(format!("{:.1}", value as f64), attributes)
            }
            _ => Rendered::unavailable(attributes),
        }
    }

    async fn handle(&self, command: EntityCommand, snapshot: &Snapshot) -> Result<(), RequestError> {
        let EntityCommand::SetValue { value } = command else {
            return Err(RequestError::Invalid(format!(
                "{} only supports set_value",
                self.info.entity_id
            )));
        };

        let (min, max) = self.bounds(snapshot);
        if !value.is_finite() || value < min || value > max {
            return Err(RequestError::Invalid(format!(
                "{} is outside {}..={} for {}",
                value, min, max, self.info.entity_id
            )));
        }

        let amps = value.round() as i64;
        let result = set_charge_current(self.charger.as_ref(), amps).await;
        report_write(&self.info.name, &amps.to_string(), result)
    }
}
