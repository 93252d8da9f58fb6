//! Forward external sensor readings (grid, solar, voltage, shaper power) to
//! the charger whenever their state changes.

use std::sync::Arc;

use openevse_http::ClientError;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::warn;

use super::CONF_GRID;
use super::CONF_INVERT;
use super::CONF_SHAPER;
use super::CONF_SOLAR;
use super::CONF_VOLTAGE;
use super::charger::Charger;
use crate::engine::ConfigEntry;
use crate::engine::Event;
use crate::engine::Host;
use crate::engine::state::STATE_UNAVAILABLE;
use crate::engine::state::STATE_UNKNOWN;

/// Which reading an entity feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Feed {
    Grid,
    Solar,
    Voltage,
    Shaper,
}

/// Entities tracked for one entry. Solar is only used without a grid sensor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassthroughSensors {
    pub grid: Option<String>,
    pub solar: Option<String>,
    pub voltage: Option<String>,
    pub shaper: Option<String>,
    pub invert: bool,
}

fn entity_setting(entry: &ConfigEntry, key: &str) -> Option<String> {
    entry
        .setting(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl PassthroughSensors {
    pub fn from_entry(entry: &ConfigEntry) -> Self {
        let grid = entity_setting(entry, CONF_GRID);
        let solar = match grid {
            Some(_) => None,
            None => entity_setting(entry, CONF_SOLAR),
        };
        Self {
            grid,
            solar,
            voltage: entity_setting(entry, CONF_VOLTAGE),
            shaper: entity_setting(entry, CONF_SHAPER),
            invert: entry
                .setting(CONF_INVERT)
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.feeds().next().is_none()
    }

    fn feeds(&self) -> impl Iterator<Item = (Feed, &str)> {
        [
            (Feed::Grid, &self.grid),
            (Feed::Solar, &self.solar),
            (Feed::Voltage, &self.voltage),
            (Feed::Shaper, &self.shaper),
        ]
        .into_iter()
        .filter_map(|(feed, entity)| entity.as_deref().map(|e| (feed, e)))
    }

    /// Feeds driven by `entity_id`.
    pub fn feeds_for<'a>(&'a self, entity_id: &'a str) -> impl Iterator<Item = Feed> + 'a {
        self.feeds()
            .filter(move |(_, e)| *e == entity_id)
            .map(|(feed, _)| feed)
    }
}

/// Reading as sent to the charger. `Ok(None)` clears it.
pub fn parse_reading(state: Option<&str>) -> Result<Option<i64>, String> {
    match state.map(str::trim) {
        None | Some("") | Some(STATE_UNAVAILABLE) | Some(STATE_UNKNOWN) => Ok(None),
        Some(s) => s
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(|v| Some(v.round_ties_even() as i64))
            .ok_or_else(|| format!("'{}' is not a number", s)),
    }
}

/// Send one reading. Failures are logged, never returned.
pub async fn push(charger: &dyn Charger, sensors: &PassthroughSensors, feed: Feed, value: Option<i64>) {
    debug!(
        "Sending sensor data to OpenEVSE: ({}: {})",
        feed,
        value.map_or_else(|| "None".to_string(), |v| v.to_string())
    );

    let result = match feed {
        Feed::Grid => charger.self_production(value, None, sensors.invert).await,
        Feed::Solar => charger.self_production(None, value, false).await,
        Feed::Voltage => charger.grid_voltage(value).await,
        Feed::Shaper => charger.set_shaper_live_pwr(value).await,
    };

    match result {
        Ok(()) => {}
        Err(ClientError::Timeout { host }) => error!(
            "Timeout error connecting to device: {}, please check your network connection.",
            host
        ),
        Err(e) => warn!("Could not send {} reading to {}: {}", feed, charger.host(), e),
    }
}

/// Follow state changes of the tracked entities until aborted.
pub fn spawn(host: &Host, charger: Arc<dyn Charger>, sensors: PassthroughSensors) -> JoinHandle<()> {
    let mut events = host.subscribe();
    tokio::spawn(async move {
        loop {
            let (entity_id, new_state) = match events.recv().await {
                Ok(Event::StateChanged {
                    entity_id,
                    new_state,
                    ..
                }) => (entity_id, new_state),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Passthrough fell behind, {} state changes skipped", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let feeds: Vec<Feed> = sensors.feeds_for(&entity_id).collect();
            if feeds.is_empty() {
                continue;
            }

            let value = match parse_reading(new_state.as_ref().map(|s| s.state.as_str())) {
                Ok(value) => value,
                Err(e) => {
                    warn!("Ignoring reading from {}: {}", entity_id, e);
                    continue;
                }
            };
            for feed in feeds {
                push(charger.as_ref(), &sensors, feed, value).await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use serde_json::Map;
    use serde_json::json;

    use super::*;
    use crate::engine::Engine;
    use crate::integrations::openevse::charger::Call;
    use crate::integrations::openevse::charger::MockCharger;
    use crate::integrations::openevse::charger::MockFailure;

    fn entry(data: Value, options: Value) -> ConfigEntry {
        let mut entry = ConfigEntry::new(
            "openevse",
            "openevse",
            data.as_object().cloned().unwrap_or_default(),
            "user",
            2,
        );
        entry.options = options.as_object().cloned().unwrap_or_default();
        entry
    }

    #[test]
    fn test_parse_reading() {
        assert_eq!(parse_reading(Some("4100")), Ok(Some(4100)));
        assert_eq!(parse_reading(Some("-200.5")), Ok(Some(-200)));
        assert_eq!(parse_reading(Some("2.5")), Ok(Some(2)));
        assert_eq!(parse_reading(Some("3.5")), Ok(Some(4)));
        assert_eq!(parse_reading(Some("unavailable")), Ok(None));
        assert_eq!(parse_reading(Some("unknown")), Ok(None));
        assert_eq!(parse_reading(None), Ok(None));
        assert!(parse_reading(Some("lots")).is_err());
    }

    #[test]
    fn test_solar_only_without_grid() {
        let sensors = PassthroughSensors::from_entry(&entry(
            json!({"grid": "sensor.grid", "solar": "sensor.solar", "voltage": ""}),
            json!({"invert_grid": true}),
        ));
        assert_eq!(sensors.grid.as_deref(), Some("sensor.grid"));
        assert_eq!(sensors.solar, None);
        assert_eq!(sensors.voltage, None);
        assert!(sensors.invert);

        // Options win over data
        let sensors = PassthroughSensors::from_entry(&entry(
            json!({"grid": "sensor.grid"}),
            json!({"grid": "", "solar": "sensor.pv"}),
        ));
        assert_eq!(sensors.grid, None);
        assert_eq!(sensors.solar.as_deref(), Some("sensor.pv"));

        assert!(PassthroughSensors::default().is_empty());
    }

    #[tokio::test]
    async fn test_push_logs_failures() {
        let mock = MockCharger::fixture();
        let sensors = PassthroughSensors {
            invert: true,
            ..PassthroughSensors::default()
        };
        mock.fail_writes(Some(MockFailure::Timeout));
        push(mock.as_ref(), &sensors, Feed::Grid, Some(10)).await;
        mock.fail_writes(None);
        push(mock.as_ref(), &sensors, Feed::Voltage, Some(240)).await;
        push(mock.as_ref(), &sensors, Feed::Shaper, None).await;

        assert_eq!(
            mock.calls(),
            vec![
                Call::SelfProduction {
                    grid: Some(10),
                    solar: None,
                    invert: true
                },
                Call::GridVoltage(Some(240)),
                Call::ShaperLivePwr(None),
            ]
        );
    }

    #[tokio::test]
    async fn test_state_changes_are_forwarded() {
        let engine = Engine::default();
        let mock = MockCharger::fixture();
        let sensors = PassthroughSensors {
            solar: Some("sensor.pv".to_string()),
            voltage: Some("sensor.mains".to_string()),
            ..PassthroughSensors::default()
        };
        let task = spawn(&engine.host(), mock.clone(), sensors);

        engine.set_state("sensor.pv", "1234.4", Map::new());
        engine.set_state("sensor.kitchen", "21", Map::new());
        engine.set_state("sensor.mains", "garbage", Map::new());
        engine.set_state("sensor.mains", "239.6", Map::new());

        for _ in 0..100 {
            if mock.calls().len() >= 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        task.abort();

        assert_eq!(
            mock.calls(),
            vec![
                Call::SelfProduction {
                    grid: None,
                    solar: Some(1234),
                    invert: false
                },
                Call::GridVoltage(Some(240)),
            ]
        );
    }

    #[tokio::test]
    async fn test_grid_changes_are_sent_once_each() {
        let engine = Engine::default();
        let mock = MockCharger::fixture();
        let sensors = PassthroughSensors {
            grid: Some("sensor.grid".to_string()),
            invert: true,
            ..PassthroughSensors::default()
        };
        let task = spawn(&engine.host(), mock.clone(), sensors);

        engine.set_state("sensor.grid", "4100", Map::new());
        engine.set_state("sensor.grid", "-200", Map::new());

        for _ in 0..100 {
            if mock.calls().len() >= 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        // Nothing else may trail in
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        task.abort();

        assert_eq!(
            mock.calls(),
            vec![
                Call::SelfProduction {
                    grid: Some(4100),
                    solar: None,
                    invert: true
                },
                Call::SelfProduction {
                    grid: Some(-200),
                    solar: None,
                    invert: true
                },
            ]
        );
    }
}
