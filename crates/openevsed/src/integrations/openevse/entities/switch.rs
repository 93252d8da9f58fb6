use std::sync::Arc;

use async_trait::async_trait;
use openevse_http::ClaimRequest;
use serde_json::Value;
use tracing::debug;

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
use crate::integrations::openevse::accessor::Attribute;
use crate::integrations::openevse::charger::Charger;
use crate::integrations::openevse::coordinator::Snapshot;
use crate::integrations::openevse::descriptions::SwitchDescription;
use crate::integrations::openevse::descriptions::ToggleCommand;

pub struct Switch {
    info: EntityInfo,
    description: &'static SwitchDescription,
    charger: Arc<dyn Charger>,
}

impl Switch {
    pub fn new(ctx: &EntityContext, description: &'static SwitchDescription) -> Self {
        let name = description.base.name;
        Self {
            info: ctx.info(
                Platform::Switch,
                name,
                format!("{} {}_{}", ctx.name, name, ctx.entry_id),
            ),
            description,
            charger: ctx.charger.clone(),
        }
    }

    /// Current position, if known.
    fn is_on(&self, snapshot: &Snapshot) -> Option<bool> {
        let value = snapshot.get(self.description.base.attribute.key())?;
        Some(match self.description.base.attribute {
            Attribute::State => value
                .as_str()
                .is_some_and(|s| s.eq_ignore_ascii_case("sleeping")),
            _ => matches!(value, Value::Bool(true)) || value.as_i64() == Some(1),
        })
    }

    async fn toggle(&self, on: bool) -> Result<(), openevse_http::ClientError> {
        match self.description.toggle {
            ToggleCommand::ToggleOverride => self.charger.toggle_override().await,
            ToggleCommand::Claim if on => {
                let claim = ClaimRequest {
                    state: Some("disabled".to_string()),
                    ..ClaimRequest::default()
                };
                self.charger.make_claim(&claim).await.map(|_| ())
            }
            ToggleCommand::Claim => self.charger.release_claim().await.map(|_| ()),
            ToggleCommand::DivertMode => self.charger.set_divert_enabled(on).await,
        }
    }
}

#[async_trait]
impl Entity for Switch {
    fn info(&self) -> &EntityInfo {
        &self.info
    }

    fn render(&self, view: &View<'_>) -> Rendered {
        let attributes = base_attributes(&self.info, &self.description.base);
        match self.is_on(view.snapshot) {
            Some(on) if view.available(&self.description.base) => {
                Rendered::new(on_off(on), attributes)
            }
            _ => Rendered::unavailable(attributes),
        }
    }

    async fn handle(&self, command: EntityCommand, snapshot: &Snapshot) -> Result<(), RequestError> {
        let on = match command {
            EntityCommand::TurnOn { .. } => true,
            EntityCommand::TurnOff => false,
            other => {
                return Err(RequestError::Invalid(format!(
                    "{} does not support {:?}",
                    self.info.entity_id, other
                )));
            }
        };

        if self.is_on(snapshot) == Some(on) {
            debug!("{} is already {}", self.info.entity_id, on_off(on));
            return Ok(());
        }

        self.toggle(on)
            .await
            .map_err(|e| RequestError::Failed(e.to_string()))
    }
}
