//! Entity metadata and the commands the engine can route to an entity.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Entity platform, also the prefix of every entity id.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Platform {
    Sensor,
    BinarySensor,
    Switch,
    Select,
    Number,
    Light,
    Button,
    Update,
}

/// Registration record sent by an integration when it creates an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityInfo {
    pub entity_id: String,
    pub platform: Platform,
    pub name: String,
    pub unique_id: String,
    pub device_id: Option<String>,
    pub config_entry_id: Option<String>,
}

/// An action requested on an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityCommand {
    TurnOn { brightness: Option<u8> },
    TurnOff,
    SelectOption { option: String },
    SetValue { value: f64 },
    Press,
}

#[derive(Debug, Error, PartialEq)]
pub enum EntityCommandError {
    #[error("Unknown entity command '{0}'")]
    Unknown(String),

    #[error("'{command}' requires '{field}'")]
    MissingField {
        command: &'static str,
        field: &'static str,
    },

    #[error("Invalid '{field}' for '{command}'")]
    InvalidField {
        command: &'static str,
        field: &'static str,
    },
}

impl EntityCommand {
    /// Build a command from its name and a JSON body, as received over HTTP.
    pub fn from_parts(command: &str, body: &Value) -> Result<Self, EntityCommandError> {
        match command {
            "turn_on" => {
                let brightness = match body.get("brightness") {
                    None | Some(Value::Null) => None,
                    Some(v) => Some(
                        v.as_u64()
                            .and_then(|b| u8::try_from(b).ok())
                            .ok_or(EntityCommandError::InvalidField {
                                command: "turn_on",
                                field: "brightness",
                            })?,
                    ),
                };
                Ok(EntityCommand::TurnOn { brightness })
            }
            "turn_off" => Ok(EntityCommand::TurnOff),
            "select_option" => {
                let option = body.get("option").ok_or(EntityCommandError::MissingField {
                    command: "select_option",
                    field: "option",
                })?;
                let option = match option {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    _ => {
                        return Err(EntityCommandError::InvalidField {
                            command: "select_option",
                            field: "option",
                        })
                    }
                };
                Ok(EntityCommand::SelectOption { option })
            }
            "set_value" => {
                let value = body.get("value").ok_or(EntityCommandError::MissingField {
                    command: "set_value",
                    field: "value",
                })?;
                let value = value
                    .as_f64()
                    .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                    .ok_or(EntityCommandError::InvalidField {
                        command: "set_value",
                        field: "value",
                    })?;
                Ok(EntityCommand::SetValue { value })
            }
            "press" => Ok(EntityCommand::Press),
            other => Err(EntityCommandError::Unknown(other.to_string())),
        }
    }
}
