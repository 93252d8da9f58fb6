use serde::Deserialize;
use serde::Serialize;

use crate::error::ClientError;

/// Body for `POST /override`. Unset fields are omitted from the request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverrideRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_current: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_current: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy_limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_release: Option<bool>,
}

/// Body for `POST /claims/{client}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_current: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_current: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_release: Option<bool>,
}

/// Body for `POST /limit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitRequest {
    #[serde(rename = "type")]
    pub limit_type: String,
    pub value: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_release: Option<bool>,
}

const LIMIT_TYPES: &[&str] = &["time", "energy", "soc", "range"];
const CLAIM_STATES: &[&str] = &["active", "disabled"];

impl OverrideRequest {
    pub(crate) fn validate(&self) -> Result<(), ClientError> {
        validate_state(self.state.as_deref())
    }
}

impl ClaimRequest {
    pub(crate) fn validate(&self) -> Result<(), ClientError> {
        validate_state(self.state.as_deref())
    }
}

impl LimitRequest {
    pub(crate) fn validate(&self) -> Result<(), ClientError> {
        if !LIMIT_TYPES.contains(&self.limit_type.as_str()) {
            return Err(ClientError::invalid(
                "type",
                format!(
                    "'{}' is not one of {}",
                    self.limit_type,
                    LIMIT_TYPES.join(", ")
                ),
            ));
        }
        Ok(())
    }
}

fn validate_state(state: Option<&str>) -> Result<(), ClientError> {
    match state {
        Some(s) if !CLAIM_STATES.contains(&s) => Err(ClientError::invalid(
            "state",
            format!("'{}' is not one of {}", s, CLAIM_STATES.join(", ")),
        )),
        _ => Ok(()),
    }
}

/// Charger identity read from `/config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub serial: String,
    pub model: String,
}

/// Latest upstream firmware release for the gateway's hardware family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareRelease {
    pub latest_version: String,
    pub release_summary: String,
    pub release_url: String,
}
