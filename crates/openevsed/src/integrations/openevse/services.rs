//! Charger services: overrides, limits and claims addressed by device id.
//!
//! A call names one or more devices. Each device's first connection holds the
//! id of the config entry that owns it, which in turn leads to the charger.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use openevse_http::ClaimRequest;
use openevse_http::LimitRequest;
use openevse_http::OverrideRequest;
use serde_json::Map;
use serde_json::Value;
use strum::IntoEnumIterator;
use thiserror::Error;
use tracing::debug;
use tracing::error;

use super::charger::Charger;
use crate::engine::DeviceRegistry;
use crate::engine::RequestError;
use crate::engine::ServiceCall;
use crate::engine::SupportsResponse;

const ATTR_DEVICE_ID: &str = "device_id";
const ATTR_STATE: &str = "state";
const ATTR_CHARGE_CURRENT: &str = "charge_current";
const ATTR_MAX_CURRENT: &str = "max_current";
const ATTR_ENERGY_LIMIT: &str = "energy_limit";
const ATTR_TIME_LIMIT: &str = "time_limit";
const ATTR_AUTO_RELEASE: &str = "auto_release";
const ATTR_TYPE: &str = "type";
const ATTR_VALUE: &str = "value";

const CURRENT_RANGE: (i64, i64) = (1, 48);
const LIMIT_RANGE: (i64, i64) = (1, 2_147_483_647);

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum Service {
    SetOverride,
    ClearOverride,
    SetLimit,
    GetLimit,
    ClearLimit,
    MakeClaim,
    ReleaseClaim,
    ListClaims,
    ListOverrides,
}

impl Service {
    pub fn supports_response(self) -> SupportsResponse {
        match self {
            Service::GetLimit | Service::ListClaims | Service::ListOverrides => {
                SupportsResponse::Only
            }
            _ => SupportsResponse::None,
        }
    }

    pub fn all() -> impl Iterator<Item = Service> {
        Service::iter()
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ServiceCallError {
    #[error("Unknown service {0}")]
    UnknownService(String),

    #[error("required key not provided @ data['{0}']")]
    Missing(&'static str),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Device ID {0} is not valid")]
    DeviceNotValid(String),

    #[error("Device ID {0} has no connections")]
    NoConnections(String),
}

impl From<ServiceCallError> for RequestError {
    fn from(err: ServiceCallError) -> Self {
        match err {
            ServiceCallError::UnknownService(_) => RequestError::NotFound(err.to_string()),
            _ => RequestError::Invalid(err.to_string()),
        }
    }
}

/// A validated call: what to do, and to which devices.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCall {
    pub device_ids: Vec<String>,
    pub request: ServiceRequest,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServiceRequest {
    SetOverride(OverrideRequest),
    ClearOverride,
    SetLimit(LimitRequest),
    GetLimit,
    ClearLimit,
    MakeClaim(ClaimRequest),
    ReleaseClaim,
    ListClaims,
    ListOverrides,
}

impl ServiceRequest {
    pub fn service(&self) -> Service {
        match self {
            ServiceRequest::SetOverride(_) => Service::SetOverride,
            ServiceRequest::ClearOverride => Service::ClearOverride,
            ServiceRequest::SetLimit(_) => Service::SetLimit,
            ServiceRequest::GetLimit => Service::GetLimit,
            ServiceRequest::ClearLimit => Service::ClearLimit,
            ServiceRequest::MakeClaim(_) => Service::MakeClaim,
            ServiceRequest::ReleaseClaim => Service::ReleaseClaim,
            ServiceRequest::ListClaims => Service::ListClaims,
            ServiceRequest::ListOverrides => Service::ListOverrides,
        }
    }
}

/// Validate the call data against the service's schema.
pub fn parse(service: &str, data: &Value) -> Result<ParsedCall, ServiceCallError> {
    let service = Service::from_str(service)
        .map_err(|_| ServiceCallError::UnknownService(service.to_string()))?;
    let empty = Map::new();
    let data = match data {
        Value::Object(map) => map,
        Value::Null => &empty,
        _ => {
            return Err(ServiceCallError::Invalid {
                field: "data",
                reason: "expected a dictionary".to_string(),
            });
        }
    };

    let device_ids = device_ids(data)?;
    let request = match service {
        Service::SetOverride => ServiceRequest::SetOverride(OverrideRequest {
            state: optional_string(data, ATTR_STATE)?,
            charge_current: optional_int(data, ATTR_CHARGE_CURRENT, CURRENT_RANGE)?,
            max_current: optional_int(data, ATTR_MAX_CURRENT, CURRENT_RANGE)?,
            energy_limit: optional_int(data, ATTR_ENERGY_LIMIT, LIMIT_RANGE)?,
            time_limit: optional_int(data, ATTR_TIME_LIMIT, LIMIT_RANGE)?,
            auto_release: optional_bool(data, ATTR_AUTO_RELEASE)?,
        }),
        Service::MakeClaim => ServiceRequest::MakeClaim(ClaimRequest {
            state: optional_string(data, ATTR_STATE)?,
            charge_current: optional_int(data, ATTR_CHARGE_CURRENT, CURRENT_RANGE)?,
            max_current: optional_int(data, ATTR_MAX_CURRENT, CURRENT_RANGE)?,
            auto_release: optional_bool(data, ATTR_AUTO_RELEASE)?,
        }),
        Service::SetLimit => ServiceRequest::SetLimit(LimitRequest {
            limit_type: optional_string(data, ATTR_TYPE)?
                .ok_or(ServiceCallError::Missing(ATTR_TYPE))?,
            value: optional_int(data, ATTR_VALUE, (i64::MIN, i64::MAX))?
                .ok_or(ServiceCallError::Missing(ATTR_VALUE))?,
            auto_release: optional_bool(data, ATTR_AUTO_RELEASE)?,
        }),
        Service::ClearOverride => ServiceRequest::ClearOverride,
        Service::GetLimit => ServiceRequest::GetLimit,
        Service::ClearLimit => ServiceRequest::ClearLimit,
        Service::ReleaseClaim => ServiceRequest::ReleaseClaim,
        Service::ListClaims => ServiceRequest::ListClaims,
        Service::ListOverrides => ServiceRequest::ListOverrides,
    };

    Ok(ParsedCall {
        device_ids,
        request,
    })
}

fn device_ids(data: &Map<String, Value>) -> Result<Vec<String>, ServiceCallError> {
    let invalid = || ServiceCallError::Invalid {
        field: ATTR_DEVICE_ID,
        reason: "expected a string or a list of strings".to_string(),
    };
    match data.get(ATTR_DEVICE_ID) {
        None | Some(Value::Null) => Err(ServiceCallError::Missing(ATTR_DEVICE_ID)),
        Some(Value::String(id)) => Ok(vec![id.clone()]),
        Some(Value::Array(ids)) => ids
            .iter()
            .map(|id| id.as_str().map(str::to_string).ok_or_else(invalid))
            .collect(),
        Some(_) => Err(invalid()),
    }
}

fn optional_string(
    data: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, ServiceCallError> {
    match data.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(v @ (Value::Number(_) | Value::Bool(_))) => Ok(Some(v.to_string())),
        Some(_) => Err(ServiceCallError::Invalid {
            field,
            reason: "expected a string".to_string(),
        }),
    }
}

fn optional_int(
    data: &Map<String, Value>,
    field: &'static str,
    (min, max): (i64, i64),
) -> Result<Option<i64>, ServiceCallError> {
    let invalid = |reason: String| ServiceCallError::Invalid { field, reason };
    let value = match data.get(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .ok_or_else(|| invalid(format!("{} is not an integer", n)))?,
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| invalid(format!("'{}' is not an integer", s)))?,
        Some(other) => return Err(invalid(format!("{} is not an integer", other))),
    };

    if value < min || value > max {
        return Err(invalid(format!(
            "value must be between {} and {}",
            min, max
        )));
    }
    Ok(Some(value))
}

fn optional_bool(
    data: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<bool>, ServiceCallError> {
    match data.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::Number(n)) => Ok(Some(n.as_f64().is_some_and(|f| f != 0.0))),
        Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "true" | "on" | "yes" | "1" => Ok(Some(true)),
            "false" | "off" | "no" | "0" => Ok(Some(false)),
            _ => Err(ServiceCallError::Invalid {
                field,
                reason: format!("'{}' is not a boolean", s),
            }),
        },
        Some(other) => Err(ServiceCallError::Invalid {
            field,
            reason: format!("{} is not a boolean", other),
        }),
    }
}

/// Config entry owning a device.
fn config_id(devices: &DeviceRegistry, device_id: &str) -> Result<String, ServiceCallError> {
    let device = devices
        .get(device_id)
        .ok_or_else(|| ServiceCallError::DeviceNotValid(device_id.to_string()))?;
    debug!("Device_entry: {:?}", device);
    device
        .connections
        .first()
        .map(|c| c.id().to_string())
        .ok_or_else(|| ServiceCallError::NoConnections(device_id.to_string()))
}

async fn execute(charger: &dyn Charger, request: &ServiceRequest) -> Result<Value, RequestError> {
    let failed = |e: openevse_http::ClientError| match e {
        openevse_http::ClientError::InvalidField { .. } => RequestError::Invalid(e.to_string()),
        _ => RequestError::Failed(e.to_string()),
    };

    let response = match request {
        ServiceRequest::SetOverride(body) => charger.set_override(body).await,
        ServiceRequest::ClearOverride => charger.clear_override().await,
        ServiceRequest::SetLimit(body) => charger.set_limit(body).await,
        ServiceRequest::GetLimit => charger.get_limit().await,
        ServiceRequest::ClearLimit => charger.clear_limit().await,
        ServiceRequest::MakeClaim(body) => charger.make_claim(body).await,
        ServiceRequest::ReleaseClaim => charger.release_claim().await,
        ServiceRequest::ListClaims => charger.list_claims().await.map(index_claims),
        ServiceRequest::ListOverrides => charger.get_override().await,
    }
    .map_err(failed)?;

    debug!("{} response: {}", request.service(), response);
    Ok(response)
}

/// `[a, b]` becomes `{"0": a, "1": b}`.
fn index_claims(claims: Value) -> Value {
    match claims {
        Value::Array(claims) => Value::Object(
            claims
                .into_iter()
                .enumerate()
                .map(|(i, claim)| (i.to_string(), claim))
                .collect(),
        ),
        other => other,
    }
}

/// Run a parsed call. Services with a response answer for the first device.
pub async fn call(
    parsed: &ParsedCall,
    devices: &DeviceRegistry,
    chargers: &HashMap<String, Arc<dyn Charger>>,
) -> Result<Option<Value>, RequestError> {
    let returns = parsed.request.service().supports_response() != SupportsResponse::None;

    for device_id in &parsed.device_ids {
        debug!("Device ID: {}", device_id);
        let config_id = config_id(devices, device_id)?;
        debug!("Config ID: {}", config_id);

        let Some(charger) = chargers.get(&config_id) else {
            error!("Error locating configuration: {}", config_id);
            if returns {
                return Ok(Some(Value::Object(Map::new())));
            }
            continue;
        };

        let response = execute(charger.as_ref(), &parsed.request).await?;
        if returns {
            return Ok(Some(response));
        }
    }

    Ok(returns.then(|| Value::Object(Map::new())))
}

/// Parse and run a call routed to this integration.
pub async fn handle(
    call: &ServiceCall,
    devices: &DeviceRegistry,
    chargers: &HashMap<String, Arc<dyn Charger>>,
) -> Result<Option<Value>, RequestError> {
    let parsed = parse(&call.service, &call.data)?;
    self::call(&parsed, devices, chargers).await
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::engine::DeviceConnection;
    use crate::engine::DeviceInfo;
    use crate::integrations::openevse::charger::Call;
    use crate::integrations::openevse::charger::MockCharger;

    fn registry() -> (DeviceRegistry, String) {
        let devices = DeviceRegistry::new();
        let device = devices.get_or_create(
            "01entry",
            DeviceInfo {
                connections: vec![DeviceConnection::new("openevse", "01entry")],
                name: "openevse".to_string(),
                ..DeviceInfo::default()
            },
        );
        (devices, device.id.clone())
    }

    fn chargers(mock: &Arc<MockCharger>) -> HashMap<String, Arc<dyn Charger>> {
        let mut chargers: HashMap<String, Arc<dyn Charger>> = HashMap::new();
        chargers.insert("01entry".to_string(), mock.clone());
        chargers
    }

    #[test]
    fn test_service_table() {
        let services: Vec<&'static str> = Service::all().map(Into::into).collect();
        assert_eq!(services.len(), 9);
        assert!(services.contains(&"list_overrides"));
        assert_eq!(Service::GetLimit.supports_response(), SupportsResponse::Only);
        assert_eq!(Service::MakeClaim.supports_response(), SupportsResponse::None);
    }

    #[test]
    fn test_parse_set_override() {
        let parsed = parse(
            "set_override",
            &json!({
                "device_id": "abc",
                "state": "active",
                "charge_current": "16",
                "energy_limit": 5000.7,
                "auto_release": "false",
            }),
        )
        .unwrap();
        assert_eq!(parsed.device_ids, vec!["abc"]);
        assert_eq!(
            parsed.request,
            ServiceRequest::SetOverride(OverrideRequest {
                state: Some("active".to_string()),
                charge_current: Some(16),
                energy_limit: Some(5000),
                auto_release: Some(false),
                ..OverrideRequest::default()
            })
        );
    }

    #[test]
    fn test_parse_rejects_bad_data() {
        assert_eq!(
            parse("clear_override", &json!({})),
            Err(ServiceCallError::Missing("device_id"))
        );
        assert!(matches!(
            parse("set_override", &json!({"device_id": "a", "charge_current": 49})),
            Err(ServiceCallError::Invalid { field: "charge_current", .. })
        ));
        assert!(matches!(
            parse("make_claim", &json!({"device_id": "a", "max_current": 0})),
            Err(ServiceCallError::Invalid { field: "max_current", .. })
        ));
        assert_eq!(
            parse("set_limit", &json!({"device_id": ["a"], "type": "energy"})),
            Err(ServiceCallError::Missing("value"))
        );
        assert!(matches!(
            parse("reboot", &json!({"device_id": "a"})),
            Err(ServiceCallError::UnknownService(_))
        ));
    }

    #[tokio::test]
    async fn test_set_limit_reaches_charger() {
        let (devices, device_id) = registry();
        let mock = MockCharger::fixture();
        let parsed = parse(
            "set_limit",
            &json!({"device_id": [device_id], "type": "time", "value": 3600}),
        )
        .unwrap();

        let response = call(&parsed, &devices, &chargers(&mock)).await.unwrap();
        assert_eq!(response, None);
        assert_eq!(
            mock.calls(),
            vec![Call::SetLimit(LimitRequest {
                limit_type: "time".to_string(),
                value: 3600,
                auto_release: None,
            })]
        );
    }

    #[tokio::test]
    async fn test_set_override_with_state_only() {
        let (devices, device_id) = registry();
        let mock = MockCharger::fixture();
        let parsed = parse(
            "set_override",
            &json!({"device_id": device_id, "state": "disabled"}),
        )
        .unwrap();

        let response = call(&parsed, &devices, &chargers(&mock)).await.unwrap();
        assert_eq!(response, None);
        assert_eq!(
            mock.calls(),
            vec![Call::SetOverride(OverrideRequest {
                state: Some("disabled".to_string()),
                ..OverrideRequest::default()
            })]
        );
    }

    #[tokio::test]
    async fn test_list_claims_is_indexed() {
        let (devices, device_id) = registry();
        let mock = MockCharger::fixture();
        mock.set_claims(json!([{"client": 65537, "priority": 10}, {"client": 65540}]));
        let parsed = parse("list_claims", &json!({"device_id": device_id})).unwrap();

        let response = call(&parsed, &devices, &chargers(&mock)).await.unwrap();
        assert_eq!(
            response,
            Some(json!({"0": {"client": 65537, "priority": 10}, "1": {"client": 65540}}))
        );
    }

    #[tokio::test]
    async fn test_unknown_device_and_missing_entry() {
        let (devices, device_id) = registry();
        let mock = MockCharger::fixture();

        let parsed = parse("clear_limit", &json!({"device_id": "nope"})).unwrap();
        assert_eq!(
            call(&parsed, &devices, &chargers(&mock)).await,
            Err(RequestError::Invalid("Device ID nope is not valid".to_string()))
        );

        // Device exists but its entry is not loaded
        let parsed = parse("get_limit", &json!({"device_id": device_id})).unwrap();
        let response = call(&parsed, &devices, &HashMap::new()).await.unwrap();
        assert_eq!(response, Some(json!({})));

        let parsed = parse("release_claim", &json!({"device_id": device_id})).unwrap();
        assert_eq!(call(&parsed, &devices, &HashMap::new()).await, Ok(None));
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_device_without_connections() {
        let devices = DeviceRegistry::new();
        let device = devices.get_or_create(
            "01entry",
            DeviceInfo {
                identifiers: vec![crate::engine::DeviceIdentifier::new("openevse", "serial")],
                name: "bare".to_string(),
                ..DeviceInfo::default()
            },
        );
        let parsed = parse("get_limit", &json!({"device_id": device.id})).unwrap();
        assert_eq!(
            call(&parsed, &devices, &HashMap::new()).await,
            Err(RequestError::Invalid(format!(
                "Device ID {} has no connections",
                device.id
            )))
        );
    }
}
