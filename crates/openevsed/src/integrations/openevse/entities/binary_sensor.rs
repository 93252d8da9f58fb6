use async_trait::async_trait;

use super::Entity;
use super::EntityContext;
use super::Rendered;
use super::View;
use super::base_attributes;
use super::on_off;
use crate::engine::EntityInfo;
use crate::engine::Platform;
use crate::integrations::openevse::accessor::truthy;
use crate::integrations::openevse::descriptions::EntityDescription;

pub struct BinarySensor {
    info: EntityInfo,
    description: &'static EntityDescription,
}

impl BinarySensor {
    pub fn new(ctx: &EntityContext, description: &'static EntityDescription) -> Self {
        Self {
            info: ctx.info(
                Platform::BinarySensor,
                description.name,
                format!("{}_{}", description.name, ctx.entry_id),
            ),
            description,
        }
    }
}

#[async_trait]
impl Entity for BinarySensor {
    fn info(&self) -> &EntityInfo {
        &self.info
    }

    fn render(&self, view: &View<'_>) -> Rendered {
        let attributes = base_attributes(&self.info, self.description);
        match view.snapshot.get(self.description.attribute.key()) {
            Some(value) if view.available(self.description) => {
                Rendered::new(on_off(truthy(value)), attributes)
            }
            _ => Rendered::unavailable(attributes),
        }
    }
}
