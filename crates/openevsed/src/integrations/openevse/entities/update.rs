use async_trait::async_trait;
use serde_json::Value;

use super::Entity;
use super::EntityContext;
use super::Rendered;
use super::View;
use super::on_off;
use crate::engine::EntityInfo;
use crate::engine::Platform;

/// Gateway firmware, compared against the upstream release feed.
pub struct Update {
    info: EntityInfo,
}

impl Update {
    pub fn new(ctx: &EntityContext) -> Self {
        Self {
            info: ctx.info(Platform::Update, "Update", format!("{}.update", ctx.entry_id)),
        }
    }

    fn installed(view: &View<'_>) -> Option<String> {
        view.snapshot.get_str("wifi_firmware").map(str::to_string)
    }

    /// The upstream tag, unless it is just a longer spelling of what is
    /// already installed.
    fn latest(view: &View<'_>) -> Option<String> {
        let installed = Self::installed(view);
        let candidate = view.firmware.release.as_ref().map(|r| &r.latest_version);
        match (candidate, &installed) {
            (Some(latest), Some(current)) if !latest.starts_with(current.as_str()) => {
                Some(latest.clone())
            }
            _ => installed,
        }
    }
}

#[async_trait]
impl Entity for Update {
    fn info(&self) -> &EntityInfo {
        &self.info
    }

    fn render(&self, view: &View<'_>) -> Rendered {
        let installed = Self::installed(view);
        let latest = Self::latest(view);
        let release = view.firmware.release.as_ref();

        let mut attributes = serde_json::Map::new();
        attributes.insert("friendly_name".to_string(), Value::from(self.info.name.clone()));
        attributes.insert("device_class".to_string(), Value::from("firmware"));
        attributes.insert("installed_version".to_string(), Value::from(installed.clone()));
        attributes.insert("latest_version".to_string(), Value::from(latest.clone()));
        attributes.insert(
            "release_summary".to_string(),
            Value::from(release.map(|r| r.release_summary.clone())),
        );
        attributes.insert(
            "release_url".to_string(),
            Value::from(release.map(|r| r.release_url.clone())),
        );

        if !view.firmware.last_update_success {
            return Rendered::unavailable(attributes);
        }
        Rendered::new(on_off(latest != installed), attributes)
    }
}
