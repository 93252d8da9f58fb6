mod accessor;
mod charger;
mod command;
mod config_flow;
mod coordinator;
mod descriptions;
mod diagnostics;
mod entities;
mod entry;
mod firmware;
// Private module, re-exported below
#[allow(clippy::module_inception)]
mod openevse;
mod passthrough;
mod services;

use linkme::distributed_slice;
pub use openevse::OpenEvseIntegration;

use crate::engine;

pub const DOMAIN: &str = "openevse";
pub const MANUFACTURER: &str = "OpenEVSE";

pub const CONF_HOST: &str = "host";
pub const CONF_NAME: &str = "name";
pub const CONF_USERNAME: &str = "username";
pub const CONF_PASSWORD: &str = "password";
/// Serial property advertised over zeroconf
pub const CONF_ID: &str = "id";
pub const CONF_GRID: &str = "grid";
pub const CONF_SOLAR: &str = "solar";
pub const CONF_INVERT: &str = "invert_grid";
pub const CONF_VOLTAGE: &str = "voltage";
pub const CONF_SHAPER: &str = "shaper";

pub const DEFAULT_HOST: &str = "openevse.local";
pub const DEFAULT_NAME: &str = "OpenEVSE";

#[distributed_slice(engine::INTEGRATION_REGISTRY)]
fn init_openevse(ctx: &engine::IntegrationContext) -> engine::IntegrationFactoryResult {
    let settings = &ctx.config.integrations.openevse;
    if !settings.enabled {
        return Ok(None);
    }

    let factory = charger::http_factory(settings);
    Ok(Some(Box::new(OpenEvseIntegration::new(settings, factory))))
}
