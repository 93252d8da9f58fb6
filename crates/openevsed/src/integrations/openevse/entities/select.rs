use std::sync::Arc;

use async_trait::async_trait;
use openevse_http::OverrideRequest;
use serde_json::Value;

use super::Entity;
use super::EntityContext;
use super::Rendered;
use super::View;
use super::base_attributes;
use super::report_write;
use super::state_text;
use crate::engine::EntityCommand;
use crate::engine::EntityInfo;
use crate::engine::Platform;
use crate::engine::RequestError;
use crate::engine::state::STATE_UNKNOWN;
use crate::integrations::openevse::charger::Charger;
use crate::integrations::openevse::command::CommandError;
use crate::integrations::openevse::command::set_charge_current;
use crate::integrations::openevse::coordinator::Snapshot;
use crate::integrations::openevse::descriptions::SelectCommand;
use crate::integrations::openevse::descriptions::SelectDescription;
use crate::integrations::openevse::descriptions::SelectOptions;

pub struct Select {
    info: EntityInfo,
    description: &'static SelectDescription,
    charger: Arc<dyn Charger>,
}

impl Select {
    pub fn new(ctx: &EntityContext, description: &'static SelectDescription) -> Self {
        let name = description.base.name;
        Self {
            info: ctx.info(
                Platform::Select,
                name,
                format!("{} {}_{}", ctx.name, name, ctx.entry_id),
            ),
            description,
            charger: ctx.charger.clone(),
        }
    }

    fn options(&self, snapshot: &Snapshot) -> Vec<String> {
        match self.description.options {
            SelectOptions::Fixed(options) => options.iter().map(|o| o.to_string()).collect(),
            SelectOptions::ChargeRange => {
                match (snapshot.get_i64("min_amps"), snapshot.get_i64("max_amps")) {
                    (Some(min), Some(max)) => (min..=max).map(|a| a.to_string()).collect(),
                    _ => Vec::new(),
                }
            }
        }
    }

    fn available(&self, view: &View<'_>) -> bool {
        let snapshot = view.snapshot;
        // Eco divert owns the charge rate while it is active
        if self.description.command == SelectCommand::SetCurrent
            && snapshot.get("divert_active") == Some(&Value::Bool(true))
            && snapshot.get_str("divertmode") == Some("eco")
        {
            return false;
        }
        snapshot.last_update_success && view.version_ok(self.description.base.min_version)
    }

    async fn write(&self, option: &str) -> Result<(), CommandError> {
        match self.description.command {
            SelectCommand::SetCurrent => {
                let amps = option
                    .parse::<i64>()
                    .map_err(|_| CommandError::InvalidValue(option.to_string()))?;
                set_charge_current(self.charger.as_ref(), amps).await
            }
            SelectCommand::Override if option == "auto" => {
                self.charger.clear_override().await?;
                Ok(())
            }
            SelectCommand::Override => {
                let request = OverrideRequest {
                    state: Some(option.to_lowercase()),
                    ..OverrideRequest::default()
                };
                self.charger.set_override(&request).await?;
                Ok(())
            }
            SelectCommand::SetDivertMode => {
                self.charger.set_divert_mode(option).await?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Entity for Select {
    fn info(&self) -> &EntityInfo {
        &self.info
    }

    fn render(&self, view: &View<'_>) -> Rendered {
        let mut attributes = base_attributes(&self.info, &self.description.base);
        attributes.insert(
            "options".to_string(),
            Value::from(self.options(view.snapshot)),
        );
        if !self.available(view) {
            return Rendered::unavailable(attributes);
        }

        let current = view.snapshot.get(self.description.base.attribute.key());
        match current {
            Some(value) => Rendered::new(state_text(Some(value)), attributes),
            None => Rendered::new(STATE_UNKNOWN, attributes),
        }
    }

    async fn handle(&self, command: EntityCommand, snapshot: &Snapshot) -> Result<(), RequestError> {
        let EntityCommand::SelectOption { option } = command else {
            return Err(RequestError::Invalid(format!(
                "{} only supports select_option",
                self.info.entity_id
            )));
        };

        let options = self.options(snapshot);
        if !options.contains(&option) {
            return Err(RequestError::Invalid(format!(
                "'{}' is not a valid option for {} ({})",
                option,
                self.info.entity_id,
                options.join(", ")
            )));
        }

        let result = self.write(&option).await;
        report_write(&self.info.name, &option, result)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::integrations::openevse::charger::Call;
    use crate::integrations::openevse::charger::MockCharger;
    use crate::integrations::openevse::descriptions::SELECTS;
    use crate::integrations::openevse::entities::tests::context;
    use crate::integrations::openevse::entities::tests::fixture_snapshot;
    use crate::integrations::openevse::entities::tests::render;

    fn select(key: &str, ctx: &EntityContext) -> Select {
        Select::new(ctx, SELECTS.iter().find(|d| d.base.key == key).unwrap())
    }

    fn option(value: &str) -> EntityCommand {
        EntityCommand::SelectOption {
            option: value.to_string(),
        }
    }

    #[tokio::test]
    async fn test_charge_rate_options_follow_limits() {
        let mock = MockCharger::fixture();
        let snapshot = fixture_snapshot(&mock).await;
        let rate = select("max_current_soft", &context(mock.clone()));

        let rendered = render(&rate, &snapshot, mock.as_ref());
        assert_eq!(rendered.state, "32");
        let options = rendered.attributes["options"].as_array().unwrap();
        assert_eq!(options.len(), 43);
        assert_eq!(options[0], json!("6"));
        assert_eq!(options[42], json!("48"));
    }

    #[tokio::test]
    async fn test_charge_rate_unavailable_in_eco_divert() {
        let mock = MockCharger::fixture();
        mock.set_status("divert_active", json!(true));
        mock.set_status("divertmode", json!(2));
        let snapshot = fixture_snapshot(&mock).await;
        let ctx = context(mock.clone());

        let rate = select("max_current_soft", &ctx);
        assert_eq!(render(&rate, &snapshot, mock.as_ref()).state, "unavailable");
        let mode = select("divertmode", &ctx);
        assert_eq!(render(&mode, &snapshot, mock.as_ref()).state, "eco");
    }

    #[tokio::test]
    async fn test_override_state_writes() {
        let mock = MockCharger::fixture();
        let snapshot = fixture_snapshot(&mock).await;
        let state = select("override_state", &context(mock.clone()));
        mock.clear_calls();

        state.handle(option("auto"), &snapshot).await.unwrap();
        state.handle(option("disabled"), &snapshot).await.unwrap();

        assert_eq!(
            mock.calls(),
            vec![
                Call::ClearOverride,
                Call::SetOverride(OverrideRequest {
                    state: Some("disabled".to_string()),
                    ..OverrideRequest::default()
                }),
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_option_is_rejected() {
        let mock = MockCharger::fixture();
        let snapshot = fixture_snapshot(&mock).await;
        let rate = select("max_current_soft", &context(mock.clone()));
        mock.clear_calls();

        assert!(matches!(
            rate.handle(option("80"), &snapshot).await,
            Err(RequestError::Invalid(_))
        ));
        assert!(mock.calls().is_empty());

        rate.handle(option("16"), &snapshot).await.unwrap();
        assert_eq!(mock.calls(), vec![Call::SetCurrent(16)]);
    }

    #[tokio::test]
    async fn test_rejected_rapi_write_is_only_logged() {
        let mock = MockCharger::fixture();
        mock.set_config("version", json!("3.2.0"));
        let snapshot = fixture_snapshot(&mock).await;
        let rate = select("max_current_soft", &context(mock.clone()));
        mock.set_command_reply("$SC 10", "$NK^21");

        rate.handle(option("10"), &snapshot).await.unwrap();
        assert!(mock.calls().contains(&Call::SendCommand("$SC 10".to_string())));
    }
}
