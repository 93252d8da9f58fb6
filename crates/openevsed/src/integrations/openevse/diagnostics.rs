use serde_json::Value;
use serde_json::json;

use super::CONF_PASSWORD;
use super::coordinator::Snapshot;
use crate::engine::ConfigEntry;

pub const REDACTED: &str = "**REDACTED**";

const REDACT_KEYS: &[&str] = &[CONF_PASSWORD];

/// Replace sensitive values anywhere in `value`. Null and empty strings are
/// left alone so their absence is still visible.
pub fn redact(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                let blank = v.is_null() || v.as_str().is_some_and(str::is_empty);
                if REDACT_KEYS.contains(&key.as_str()) && !blank {
                    *v = Value::from(REDACTED);
                } else {
                    redact(v);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact),
        _ => {}
    }
}

pub fn entry_diagnostics(entry: &ConfigEntry) -> Value {
    let mut diagnostics = json!({ "config": entry });
    redact(&mut diagnostics);
    diagnostics
}

/// The cached readings, as the entities see them.
pub fn device_diagnostics(snapshot: &Snapshot) -> Value {
    Value::Object(snapshot.data.as_ref().clone())
}
