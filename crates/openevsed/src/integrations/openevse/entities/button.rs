use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde_json::Value;

use super::Entity;
use super::EntityContext;
use super::Rendered;
use super::View;
use crate::engine::EntityCommand;
use crate::engine::EntityInfo;
use crate::engine::Platform;
use crate::engine::RequestError;
use crate::engine::state::STATE_UNKNOWN;
use crate::integrations::openevse::charger::Charger;
use crate::integrations::openevse::coordinator::Snapshot;
use crate::integrations::openevse::descriptions::ButtonAction;
use crate::integrations::openevse::descriptions::ButtonDescription;
use crate::integrations::openevse::descriptions::EntityCategory;

/// A restart action. Its state is the time it was last pressed.
pub struct Button {
    info: EntityInfo,
    description: &'static ButtonDescription,
    charger: Arc<dyn Charger>,
    last_pressed: Mutex<Option<DateTime<Utc>>>,
}

impl Button {
    pub fn new(ctx: &EntityContext, description: &'static ButtonDescription) -> Self {
        Self {
            info: ctx.info(
                Platform::Button,
                description.name,
                format!("{}.{}", ctx.entry_id, description.key),
            ),
            description,
            charger: ctx.charger.clone(),
            last_pressed: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Entity for Button {
    fn info(&self) -> &EntityInfo {
        &self.info
    }

    fn render(&self, _view: &View<'_>) -> Rendered {
        let mut attributes = serde_json::Map::new();
        attributes.insert("friendly_name".to_string(), Value::from(self.info.name.clone()));
        attributes.insert("device_class".to_string(), Value::from("restart"));
        attributes.insert(
            "entity_category".to_string(),
            Value::from(EntityCategory::Config.as_ref()),
        );

        let pressed = self.last_pressed.lock().unwrap_or_else(|e| e.into_inner());
        let state = match *pressed {
            Some(at) => at.to_rfc3339(),
            None => STATE_UNKNOWN.to_string(),
        };
        Rendered::new(state, attributes)
    }

    async fn handle(&self, command: EntityCommand, _snapshot: &Snapshot) -> Result<(), RequestError> {
        if command != EntityCommand::Press {
            return Err(RequestError::Invalid(format!(
                "{} only supports press",
                self.info.entity_id
            )));
        }

        let result = match self.description.action {
            ButtonAction::RestartWifi => self.charger.restart_wifi().await,
            ButtonAction::RestartEvse => self.charger.restart_evse().await,
        };
        result.map_err(|e| RequestError::Failed(e.to_string()))?;

        *self.last_pressed.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::integrations::openevse::charger::Call;
    use crate::integrations::openevse::charger::MockCharger;
    use crate::integrations::openevse::charger::MockFailure;
    use crate::integrations::openevse::descriptions::BUTTONS;
    use crate::integrations::openevse::entities::tests::context;
    use crate::integrations::openevse::entities::tests::fixture_snapshot;
    use crate::integrations::openevse::entities::tests::render;

    #[tokio::test]
    async fn test_press_restarts_and_records_time() {
        let mock = MockCharger::fixture();
        let snapshot = fixture_snapshot(&mock).await;
        let ctx = context(mock.clone());
        let wifi = Button::new(&ctx, &BUTTONS[0]);
        let evse = Button::new(&ctx, &BUTTONS[1]);
        mock.clear_calls();

        assert_eq!(wifi.info().entity_id, "button.openevse_restart_wifi");
        assert_eq!(wifi.info().unique_id, "01entry.restart_wifi");
        let rendered = render(&wifi, &snapshot, mock.as_ref());
        assert_eq!(rendered.state, "unknown");
        assert_eq!(rendered.attributes["device_class"], json!("restart"));

        wifi.handle(EntityCommand::Press, &snapshot).await.unwrap();
        evse.handle(EntityCommand::Press, &snapshot).await.unwrap();
        assert_eq!(mock.calls(), vec![Call::RestartWifi, Call::RestartEvse]);

        let state = render(&wifi, &snapshot, mock.as_ref()).state;
        assert!(DateTime::parse_from_rfc3339(&state).is_ok());
    }

    #[tokio::test]
    async fn test_failed_press_keeps_state() {
        let mock = MockCharger::fixture();
        let snapshot = fixture_snapshot(&mock).await;
        let wifi = Button::new(&context(mock.clone()), &BUTTONS[0]);
        mock.fail_writes(Some(MockFailure::Status));

        assert!(matches!(
            wifi.handle(EntityCommand::Press, &snapshot).await,
            Err(RequestError::Failed(_))
        ));
        assert_eq!(render(&wifi, &snapshot, mock.as_ref()).state, "unknown");
    }
}
