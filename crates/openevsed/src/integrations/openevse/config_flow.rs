//! Config flows: add a charger by hand or from discovery, point an entry at a
//! new address, and edit the passthrough options.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Map;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use tracing::error;
use tracing::warn;

use super::CONF_GRID;
use super::CONF_HOST;
use super::CONF_ID;
use super::CONF_INVERT;
use super::CONF_NAME;
use super::CONF_PASSWORD;
use super::CONF_SHAPER;
use super::CONF_SOLAR;
use super::CONF_USERNAME;
use super::CONF_VOLTAGE;
use super::DEFAULT_HOST;
use super::DEFAULT_NAME;
use super::DOMAIN;
use super::charger::Connection;
use super::entry::EntryManager;
use crate::engine::ConfigEntry;
use crate::engine::FlowResult;
use crate::engine::FlowSource;
use crate::engine::FlowStep;
use crate::engine::RequestError;
use crate::engine::StoreError;

/// Version written into new entries.
pub const ENTRY_VERSION: u32 = 2;

const PASSTHROUGH_FIELDS: [&str; 4] = [CONF_GRID, CONF_SOLAR, CONF_VOLTAGE, CONF_SHAPER];

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Unknown flow {0}")]
    UnknownFlow(String),

    #[error("Config entry {0} does not exist")]
    UnknownEntry(String),

    #[error("{0} flows require an entry_id")]
    MissingEntryId(FlowSource),

    #[error("zeroconf flows need discovery info")]
    MissingDiscoveryInfo,

    #[error("{key} must be a boolean, got {value}")]
    NotABoolean { key: &'static str, value: Value },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<FlowError> for RequestError {
    fn from(e: FlowError) -> Self {
        match e {
            FlowError::UnknownFlow(_) | FlowError::UnknownEntry(_) => {
                RequestError::NotFound(e.to_string())
            }
            FlowError::Store(_) => RequestError::Failed(e.to_string()),
            _ => RequestError::Invalid(e.to_string()),
        }
    }
}

/// Where a flow waits for its next input.
#[derive(Debug, Clone)]
enum ActiveFlow {
    User,
    Reconfigure { entry_id: String },
    DiscoveryConfirm { data: Map<String, Value>, unique_id: String },
    Options { entry_id: String },
}

/// Flows that showed a form and wait to be continued, keyed by flow id.
#[derive(Default)]
pub struct ConfigFlows {
    active: HashMap<String, ActiveFlow>,
}

impl ConfigFlows {
    pub async fn step(
        &mut self,
        manager: &Arc<EntryManager>,
        flow_id: &str,
        step: FlowStep,
    ) -> Result<FlowResult, RequestError> {
        self.advance(manager, flow_id, step)
            .await
            .map_err(RequestError::from)
    }

    async fn advance(
        &mut self,
        manager: &Arc<EntryManager>,
        flow_id: &str,
        step: FlowStep,
    ) -> Result<FlowResult, FlowError> {
        let (result, next) = match step {
            FlowStep::Start {
                source,
                entry_id,
                data,
            } => start(manager, source, entry_id, data).await?,
            FlowStep::Continue { data } => {
                let flow = self
                    .active
                    .remove(flow_id)
                    .ok_or_else(|| FlowError::UnknownFlow(flow_id.to_string()))?;
                resume(manager, flow, data).await?
            }
        };

        if result.is_form() {
            self.active.insert(flow_id.to_string(), next);
        }
        Ok(result)
    }
}

type StepResult = Result<(FlowResult, ActiveFlow), FlowError>;

async fn start(
    manager: &Arc<EntryManager>,
    source: FlowSource,
    entry_id: Option<String>,
    data: Option<Value>,
) -> StepResult {
    debug!("Starting {} flow", source);
    let required_entry = || entry_id.clone().ok_or(FlowError::MissingEntryId(source));

    match (source, data) {
        (FlowSource::User, None) => Ok((user_form(&Map::new(), BTreeMap::new()), ActiveFlow::User)),
        (FlowSource::User, Some(input)) => user(manager, &input).await,
        (FlowSource::Reconfigure, None) => {
            let entry_id = required_entry()?;
            let entry = entry(manager, &entry_id)?;
            Ok((
                connection_form("reconfigure", &entry.data, BTreeMap::new()),
                ActiveFlow::Reconfigure { entry_id },
            ))
        }
        (FlowSource::Reconfigure, Some(input)) => reconfigure(manager, &required_entry()?, &input).await,
        (FlowSource::Zeroconf, Some(info)) => zeroconf(manager, &info).await,
        (FlowSource::Zeroconf, None) => Err(FlowError::MissingDiscoveryInfo),
        (FlowSource::Options, None) => {
            let entry_id = required_entry()?;
            let entry = entry(manager, &entry_id)?;
            Ok((options_form(&entry), ActiveFlow::Options { entry_id }))
        }
        (FlowSource::Options, Some(input)) => save_options(manager, &required_entry()?, &input).await,
    }
}

async fn resume(manager: &Arc<EntryManager>, flow: ActiveFlow, input: Value) -> StepResult {
    match flow {
        ActiveFlow::User => user(manager, &input).await,
        ActiveFlow::Reconfigure { entry_id } => reconfigure(manager, &entry_id, &input).await,
        ActiveFlow::DiscoveryConfirm { data, unique_id } => {
            let title = title_of(&data);
            let mut entry = ConfigEntry::new(DOMAIN, title, data, "zeroconf", ENTRY_VERSION);
            entry.unique_id = Some(unique_id);
            Ok((create(manager, entry).await?, ActiveFlow::User))
        }
        ActiveFlow::Options { entry_id } => save_options(manager, &entry_id, &input).await,
    }
}

fn entry(manager: &EntryManager, entry_id: &str) -> Result<ConfigEntry, FlowError> {
    manager
        .host()
        .entries
        .get(entry_id)
        .ok_or_else(|| FlowError::UnknownEntry(entry_id.to_string()))
}

fn title_of(data: &Map<String, Value>) -> String {
    data.get(CONF_NAME)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn text(input: &Value, key: &str) -> Option<String> {
    match input.get(key)? {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Entity-name friendly form of what the user typed.
pub fn slugify_name(name: &str) -> String {
    slug::slugify(name.to_lowercase()).replace('-', "_")
}

/// Connection settings from a submitted form, with the defaults filled in.
fn connection_input(input: &Value) -> Map<String, Value> {
    let name = text(input, CONF_NAME)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_NAME.to_string());
    let host = text(input, CONF_HOST)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    let mut data = Map::new();
    data.insert(CONF_NAME.to_string(), Value::from(slugify_name(&name)));
    data.insert(CONF_HOST.to_string(), Value::from(host));
    data.insert(
        CONF_USERNAME.to_string(),
        Value::from(text(input, CONF_USERNAME).unwrap_or_default()),
    );
    data.insert(
        CONF_PASSWORD.to_string(),
        Value::from(text(input, CONF_PASSWORD).unwrap_or_default()),
    );
    data
}

fn connection_form(
    step_id: &str,
    values: &Map<String, Value>,
    errors: BTreeMap<String, String>,
) -> FlowResult {
    let value = |key: &str, fallback: &str| {
        values
            .get(key)
            .cloned()
            .unwrap_or_else(|| Value::from(fallback))
    };
    FlowResult::Form {
        step_id: step_id.to_string(),
        errors,
        defaults: BTreeMap::from([
            (CONF_NAME.to_string(), value(CONF_NAME, DEFAULT_NAME)),
            (CONF_HOST.to_string(), value(CONF_HOST, DEFAULT_HOST)),
            (CONF_USERNAME.to_string(), value(CONF_USERNAME, "")),
            (CONF_PASSWORD.to_string(), value(CONF_PASSWORD, "")),
        ]),
        description_placeholders: BTreeMap::new(),
    }
}

fn user_form(values: &Map<String, Value>, errors: BTreeMap<String, String>) -> FlowResult {
    connection_form("user", values, errors)
}

fn communication_error() -> BTreeMap<String, String> {
    BTreeMap::from([(CONF_HOST.to_string(), "communication".to_string())])
}

/// Poll the charger once and close its websocket again.
async fn try_connect(manager: &EntryManager, data: &Map<String, Value>) -> anyhow::Result<()> {
    let connection = Connection::from_data(data);
    let charger = (manager.factory())(&connection)?;
    let result = charger.update().await;
    charger.ws_disconnect().await;
    if let Err(e) = result {
        error!("Error connecting with OpenEVSE at {}: {}", connection.host, e);
        return Err(e.into());
    }
    Ok(())
}

async fn create(manager: &Arc<EntryManager>, entry: ConfigEntry) -> Result<FlowResult, FlowError> {
    let entry = manager.host().entries.add(entry).await?;

    // A charger that is not ready yet keeps being retried in the background
    if let Err(e) = manager.load(&entry).await {
        warn!("{} was added but is not set up yet: {}", entry.title, e);
    }
    Ok(FlowResult::CreateEntry {
        entry_id: entry.entry_id,
        title: entry.title,
    })
}

async fn user(manager: &Arc<EntryManager>, input: &Value) -> StepResult {
    let data = connection_input(input);
    if try_connect(manager, &data).await.is_err() {
        return Ok((user_form(&data, communication_error()), ActiveFlow::User));
    }

    let title = title_of(&data);
    let entry = ConfigEntry::new(DOMAIN, title, data, "user", ENTRY_VERSION);
    Ok((create(manager, entry).await?, ActiveFlow::User))
}

async fn reconfigure(manager: &Arc<EntryManager>, entry_id: &str, input: &Value) -> StepResult {
    let entry = entry(manager, entry_id)?;
    // Fields left out of the form keep their current value
    let mut submitted = entry.data.clone();
    if let Some(fields) = input.as_object() {
        submitted.extend(fields.clone());
    }
    let mut data = entry.data.clone();
    data.extend(connection_input(&Value::Object(submitted)));

    let next = ActiveFlow::Reconfigure {
        entry_id: entry_id.to_string(),
    };
    if try_connect(manager, &data).await.is_err() {
        return Ok((connection_form("reconfigure", &data, communication_error()), next));
    }

    manager
        .host()
        .entries
        .update(entry_id, |e| e.data = data)
        .await?;
    if let Err(e) = manager.reload(entry_id).await {
        warn!("Reload of {} after reconfigure failed: {}", entry_id, e);
    }
    debug!("{} reconfigured.", DOMAIN);
    Ok((FlowResult::abort("reconfigure_successful"), next))
}

/// Discovery info: `{"host": .., "name": "<service name>", "properties": {"id": ..}}`.
async fn zeroconf(manager: &Arc<EntryManager>, info: &Value) -> StepResult {
    let abort = |reason: &str| -> StepResult { Ok((FlowResult::abort(reason), ActiveFlow::User)) };

    let Some(host) = text(info, CONF_HOST).filter(|h| !h.is_empty()) else {
        return abort("invalid_discovery_parameters");
    };
    let entries = manager.host().entries.by_domain(DOMAIN);
    if entries
        .iter()
        .any(|e| e.data.get(CONF_HOST).and_then(Value::as_str) == Some(host.as_str()))
    {
        return abort("already_configured");
    }

    let Some(serial) = info.get("properties").and_then(|p| text(p, CONF_ID)) else {
        return abort("invalid_discovery_parameters");
    };
    let service_name = text(info, CONF_NAME).unwrap_or_default();
    let name = format!(
        "OpenEVSE: {}",
        service_name.split('.').next().unwrap_or_default()
    );

    let mut data = Map::new();
    data.insert(CONF_HOST.to_string(), Value::from(host.clone()));
    data.insert(CONF_NAME.to_string(), Value::from(name.clone()));

    if try_connect(manager, &data).await.is_err() {
        return abort("unknown_error");
    }

    let unique_id = format!("{}_{}", name, serial);
    if let Some(existing) = entries
        .iter()
        .find(|e| e.unique_id.as_deref() == Some(unique_id.as_str()))
    {
        let updates = data.clone();
        manager
            .host()
            .entries
            .update(&existing.entry_id, |e| e.data.extend(updates))
            .await?;
        if let Err(e) = manager.reload(&existing.entry_id).await {
            warn!("Reload of {} after discovery failed: {}", existing.entry_id, e);
        }
        return abort("already_configured");
    }

    let form = FlowResult::Form {
        step_id: "discovery_confirm".to_string(),
        errors: BTreeMap::new(),
        defaults: BTreeMap::new(),
        description_placeholders: BTreeMap::from([(CONF_NAME.to_string(), name)]),
    };
    Ok((form, ActiveFlow::DiscoveryConfirm { data, unique_id }))
}

fn options_form(entry: &ConfigEntry) -> FlowResult {
    let mut defaults: BTreeMap<String, Value> = PASSTHROUGH_FIELDS
        .iter()
        .map(|key| {
            let value = entry.options.get(*key).cloned().unwrap_or_else(|| Value::from(""));
            (key.to_string(), value)
        })
        .collect();
    defaults.insert(
        CONF_INVERT.to_string(),
        entry
            .options
            .get(CONF_INVERT)
            .cloned()
            .unwrap_or(Value::Bool(false)),
    );
    FlowResult::Form {
        step_id: "init".to_string(),
        errors: BTreeMap::new(),
        defaults,
        description_placeholders: BTreeMap::new(),
    }
}

async fn save_options(manager: &Arc<EntryManager>, entry_id: &str, input: &Value) -> StepResult {
    let mut options = Map::new();
    for key in PASSTHROUGH_FIELDS {
        options.insert(key.to_string(), Value::from(text(input, key).unwrap_or_default()));
    }
    let invert = match input.get(CONF_INVERT) {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(other) => {
            return Err(FlowError::NotABoolean {
                key: CONF_INVERT,
                value: other.clone(),
            });
        }
    };
    options.insert(CONF_INVERT.to_string(), Value::Bool(invert));

    manager
        .host()
        .entries
        .update(entry_id, |e| e.options = options)
        .await?;
    if let Err(e) = manager.reload(entry_id).await {
        warn!("Reload of {} after options change failed: {}", entry_id, e);
    }

    Ok((
        FlowResult::CreateEntry {
            entry_id: entry_id.to_string(),
            title: String::new(),
        },
        ActiveFlow::Options {
            entry_id: entry_id.to_string(),
        },
    ))
}
