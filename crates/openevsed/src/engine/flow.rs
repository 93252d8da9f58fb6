use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// What started a config flow.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FlowSource {
    User,
    Zeroconf,
    Reconfigure,
    Options,
}

/// One step of input for a flow.
#[derive(Debug, Clone)]
pub enum FlowStep {
    Start {
        source: FlowSource,
        /// Entry being reconfigured or whose options are edited
        entry_id: Option<String>,
        /// User input, or discovery info for zeroconf
        data: Option<Value>,
    },
    Continue {
        data: Value,
    },
}

/// Outcome of a flow step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowResult {
    /// Show (or re-show) a form. `defaults` pre-fills its fields.
    Form {
        step_id: String,
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        errors: BTreeMap<String, String>,
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        defaults: BTreeMap<String, Value>,
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        description_placeholders: BTreeMap<String, String>,
    },
    CreateEntry {
        entry_id: String,
        title: String,
    },
    Abort {
        reason: String,
    },
}

impl FlowResult {
    pub fn form(step_id: impl Into<String>) -> Self {
        FlowResult::Form {
            step_id: step_id.into(),
            errors: BTreeMap::new(),
            defaults: BTreeMap::new(),
            description_placeholders: BTreeMap::new(),
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        FlowResult::Abort {
            reason: reason.into(),
        }
    }

    pub fn is_form(&self) -> bool {
        matches!(self, FlowResult::Form { .. })
    }
}

/// A flow result tagged with the id used to continue it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowOutcome {
    pub flow_id: String,
    #[serde(flatten)]
    pub result: FlowResult,
}
