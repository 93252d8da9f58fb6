use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use openevse_http::Callback;
use openevse_http::ClaimRequest;
use openevse_http::ClientError;
use openevse_http::ClientOptions;
use openevse_http::FirmwareRelease;
use openevse_http::Identity;
use openevse_http::LimitRequest;
use openevse_http::OpenEvse;
use openevse_http::OverrideRequest;
use openevse_http::Readings;
use openevse_http::WsState;
use serde_json::Value;

use crate::config::OpenEvseConfig;
use crate::engine::ConfigEntry;

/// Everything the integration needs from a charger.
///
/// Implemented for the HTTP client; tests substitute `MockCharger`.
#[async_trait]
pub trait Charger: Send + Sync {
    fn host(&self) -> String;

    /// Web UI of the charger
    fn url(&self) -> String;

    /// Last observed status and config
    fn readings(&self) -> Readings;

    fn version_check(&self, min: &str) -> bool;

    fn ws_state(&self) -> WsState;

    /// Called after every websocket frame has been merged into the readings
    fn set_callback(&self, callback: Callback);

    /// Start the push channel, or restart it after a drop
    fn ws_start(&self) -> Result<(), ClientError>;

    async fn ws_disconnect(&self);

    /// Disconnect and refuse any further request
    async fn close(&self);

    async fn update(&self) -> Result<(), ClientError>;

    async fn test_and_get(&self) -> Result<Identity, ClientError>;

    /// Raw RAPI command, answering with the echoed command and the reply
    async fn send_command(&self, command: &str) -> Result<(String, String), ClientError>;

    async fn get_override(&self) -> Result<Value, ClientError>;

    async fn override_state(&self) -> Result<String, ClientError>;

    async fn set_override(&self, request: &OverrideRequest) -> Result<Value, ClientError>;

    async fn clear_override(&self) -> Result<Value, ClientError>;

    async fn toggle_override(&self) -> Result<(), ClientError>;

    async fn charge_current(&self) -> Result<i64, ClientError>;

    async fn set_current(&self, amps: i64) -> Result<(), ClientError>;

    async fn set_divert_mode(&self, mode: &str) -> Result<(), ClientError>;

    async fn set_divert_enabled(&self, enabled: bool) -> Result<(), ClientError>;

    async fn set_led_brightness(&self, level: u8) -> Result<(), ClientError>;

    async fn restart_wifi(&self) -> Result<(), ClientError>;

    async fn restart_evse(&self) -> Result<(), ClientError>;

    async fn make_claim(&self, request: &ClaimRequest) -> Result<Value, ClientError>;

    async fn release_claim(&self) -> Result<Value, ClientError>;

    async fn list_claims(&self) -> Result<Value, ClientError>;

    async fn set_limit(&self, request: &LimitRequest) -> Result<Value, ClientError>;

    async fn get_limit(&self) -> Result<Value, ClientError>;

    async fn clear_limit(&self) -> Result<Value, ClientError>;

    async fn self_production(
        &self,
        grid: Option<i64>,
        solar: Option<i64>,
        invert: bool,
    ) -> Result<(), ClientError>;

    async fn grid_voltage(&self, voltage: Option<i64>) -> Result<(), ClientError>;

    async fn set_shaper_live_pwr(&self, power: Option<i64>) -> Result<(), ClientError>;

    async fn firmware_check(&self) -> Result<FirmwareRelease, ClientError>;
}

#[async_trait]
impl Charger for OpenEvse {
    fn host(&self) -> String {
        OpenEvse::host(self).to_string()
    }

    fn url(&self) -> String {
        OpenEvse::url(self)
    }

    fn readings(&self) -> Readings {
        OpenEvse::readings(self)
    }

    fn version_check(&self, min: &str) -> bool {
        OpenEvse::version_check(self, min)
    }

    fn ws_state(&self) -> WsState {
        OpenEvse::ws_state(self)
    }

    fn set_callback(&self, callback: Callback) {
        OpenEvse::set_callback(self, callback)
    }

    fn ws_start(&self) -> Result<(), ClientError> {
        OpenEvse::ws_start(self)
    }

    async fn ws_disconnect(&self) {
        OpenEvse::ws_disconnect(self).await
    }

    async fn close(&self) {
        OpenEvse::close(self).await
    }

    async fn update(&self) -> Result<(), ClientError> {
        OpenEvse::update(self).await
    }

    async fn test_and_get(&self) -> Result<Identity, ClientError> {
        OpenEvse::test_and_get(self).await
    }

    async fn send_command(&self, command: &str) -> Result<(String, String), ClientError> {
        OpenEvse::send_command(self, command).await
    }

    async fn get_override(&self) -> Result<Value, ClientError> {
        OpenEvse::get_override(self).await
    }

    async fn override_state(&self) -> Result<String, ClientError> {
        OpenEvse::override_state(self).await
    }

    async fn set_override(&self, request: &OverrideRequest) -> Result<Value, ClientError> {
        OpenEvse::set_override(self, request).await
    }

    async fn clear_override(&self) -> Result<Value, ClientError> {
        OpenEvse::clear_override(self).await
    }

    async fn toggle_override(&self) -> Result<(), ClientError> {
        OpenEvse::toggle_override(self).await
    }

    async fn charge_current(&self) -> Result<i64, ClientError> {
        OpenEvse::charge_current(self).await
    }

    async fn set_current(&self, amps: i64) -> Result<(), ClientError> {
        OpenEvse::set_current(self, amps).await
    }

    async fn set_divert_mode(&self, mode: &str) -> Result<(), ClientError> {
        OpenEvse::set_divert_mode(self, mode).await
    }

    async fn set_divert_enabled(&self, enabled: bool) -> Result<(), ClientError> {
        OpenEvse::set_divert_enabled(self, enabled).await
    }

    async fn set_led_brightness(&self, level: u8) -> Result<(), ClientError> {
        OpenEvse::set_led_brightness(self, level).await
    }

    async fn restart_wifi(&self) -> Result<(), ClientError> {
        OpenEvse::restart_wifi(self).await
    }

    async fn restart_evse(&self) -> Result<(), ClientError> {
        OpenEvse::restart_evse(self).await
    }

    async fn make_claim(&self, request: &ClaimRequest) -> Result<Value, ClientError> {
        OpenEvse::make_claim(self, request).await
    }

    async fn release_claim(&self) -> Result<Value, ClientError> {
        OpenEvse::release_claim(self).await
    }

    async fn list_claims(&self) -> Result<Value, ClientError> {
        OpenEvse::list_claims(self).await
    }

    async fn set_limit(&self, request: &LimitRequest) -> Result<Value, ClientError> {
        OpenEvse::set_limit(self, request).await
    }

    async fn get_limit(&self) -> Result<Value, ClientError> {
        OpenEvse::get_limit(self).await
    }

    async fn clear_limit(&self) -> Result<Value, ClientError> {
        OpenEvse::clear_limit(self).await
    }

    async fn self_production(
        &self,
        grid: Option<i64>,
        solar: Option<i64>,
        invert: bool,
    ) -> Result<(), ClientError> {
        OpenEvse::self_production(self, grid, solar, invert).await
    }

    async fn grid_voltage(&self, voltage: Option<i64>) -> Result<(), ClientError> {
        OpenEvse::grid_voltage(self, voltage).await
    }

    async fn set_shaper_live_pwr(&self, power: Option<i64>) -> Result<(), ClientError> {
        OpenEvse::set_shaper_live_pwr(self, power).await
    }

    async fn firmware_check(&self) -> Result<FirmwareRelease, ClientError> {
        OpenEvse::firmware_check(self).await
    }
}

/// Where and how to reach one charger, taken from a config entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub host: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Connection {
    pub fn from_data(data: &serde_json::Map<String, Value>) -> Self {
        let text = |key: &str| {
            data.get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Self {
            host: text(super::CONF_HOST).unwrap_or_else(|| super::DEFAULT_HOST.to_string()),
            username: text(super::CONF_USERNAME),
            password: text(super::CONF_PASSWORD),
        }
    }

    pub fn from_entry(entry: &ConfigEntry) -> Self {
        Self::from_data(&entry.data)
    }
}

/// Builds a charger handle for a connection.
pub type ChargerFactory = Arc<dyn Fn(&Connection) -> anyhow::Result<Arc<dyn Charger>> + Send + Sync>;

/// Factory producing HTTP clients with the configured request timeout.
pub fn http_factory(config: &OpenEvseConfig) -> ChargerFactory {
    let timeout = config.request_timeout;
    Arc::new(move |connection: &Connection| {
        let options = ClientOptions {
            username: connection.username.clone(),
            password: connection.password.clone(),
            timeout,
            ..ClientOptions::default()
        };
        let client = OpenEvse::new(connection.host.clone(), options)
            .with_context(|| format!("Failed to create client for {}", connection.host))?;
        Ok(Arc::new(client) as Arc<dyn Charger>)
    })
}

#[cfg(test)]
pub use mock::Call;
#[cfg(test)]
pub use mock::MockCharger;
#[cfg(test)]
pub use mock::MockFailure;
