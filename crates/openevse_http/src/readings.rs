//! Typed view over the gateway's `/status` and `/config` payloads.
//!
//! Every property is computed on demand from the raw JSON so a websocket
//! frame merged into the status map is visible immediately.

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use serde_json::Map;
use serde_json::Value;

use crate::error::ClientError;
use crate::version::FirmwareVersion;

/// EVSE state codes as reported in `status.state`.
const STATES: &[(i64, &str)] = &[
    (0, "unknown"),
    (1, "not connected"),
    (2, "connected"),
    (3, "charging"),
    (4, "vent required"),
    (5, "diode check failed"),
    (6, "gfci fault"),
    (7, "no ground"),
    (8, "stuck relay"),
    (9, "gfci self-test failure"),
    (10, "over temperature"),
    (11, "over current"),
    (254, "sleeping"),
    (255, "disabled"),
];

/// `shaper_cur` value meaning "no shaper limit in effect".
const SHAPER_UNLIMITED: i64 = 255;

#[derive(Debug, Clone)]
pub struct Readings {
    status: Map<String, Value>,
    config: Map<String, Value>,
    updated_at: DateTime<Utc>,
}

impl Default for Readings {
    fn default() -> Self {
        Self {
            status: Map::new(),
            config: Map::new(),
            updated_at: Utc::now(),
        }
    }
}

impl Readings {
    pub fn new(status: Map<String, Value>, config: Map<String, Value>) -> Self {
        Self {
            status,
            config,
            updated_at: Utc::now(),
        }
    }

    pub fn status_json(&self) -> &Map<String, Value> {
        &self.status
    }

    pub fn config_json(&self) -> &Map<String, Value> {
        &self.config
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_empty() && self.config.is_empty()
    }

    /// Overlay a partial status frame (websocket push) onto the current status.
    pub(crate) fn merge_status(&mut self, frame: Map<String, Value>) {
        for (k, v) in frame {
            self.status.insert(k, v);
        }
        self.updated_at = Utc::now();
    }

    /// Reflect a successful config write locally until the next poll.
    pub(crate) fn set_config(&mut self, key: &str, value: Value) {
        self.config.insert(key.to_string(), value);
    }

    pub fn firmware_version(&self) -> Result<FirmwareVersion, ClientError> {
        let raw = self.config_str("version")?;
        raw.parse()
            .map_err(|reason: String| ClientError::invalid("version", reason))
    }

    /// True when the gateway firmware is at least `min`. Unknown or
    /// unparseable firmware never satisfies a minimum.
    pub fn version_check(&self, min: &str) -> bool {
        let Ok(min) = min.parse::<FirmwareVersion>() else {
            return false;
        };
        self.firmware_version()
            .map(|current| current.satisfies(&min))
            .unwrap_or(false)
    }

    fn require(&self, feature: &str, min: &str) -> Result<(), ClientError> {
        if self.version_check(min) {
            Ok(())
        } else {
            Err(ClientError::UnsupportedFeature(feature.to_string()))
        }
    }

    // Raw field helpers

    fn status_field(&self, key: &str) -> Result<&Value, ClientError> {
        self.status
            .get(key)
            .ok_or_else(|| ClientError::MissingField(key.to_string()))
    }

    fn config_field(&self, key: &str) -> Result<&Value, ClientError> {
        self.config
            .get(key)
            .ok_or_else(|| ClientError::MissingField(key.to_string()))
    }

    fn status_f64(&self, key: &str) -> Result<f64, ClientError> {
        to_f64(key, self.status_field(key)?)
    }

    fn status_i64(&self, key: &str) -> Result<i64, ClientError> {
        to_i64(key, self.status_field(key)?)
    }

    fn status_bool(&self, key: &str) -> Result<bool, ClientError> {
        to_bool(key, self.status_field(key)?)
    }

    fn config_i64(&self, key: &str) -> Result<i64, ClientError> {
        to_i64(key, self.config_field(key)?)
    }

    fn config_str(&self, key: &str) -> Result<String, ClientError> {
        to_string(key, self.config_field(key)?)
    }

    /// Absent, `null` and `false` all mean "no reading" for optional sensors.
    fn status_opt_f64(&self, key: &str) -> Result<Option<f64>, ClientError> {
        match self.status.get(key) {
            None | Some(Value::Null) | Some(Value::Bool(false)) => Ok(None),
            Some(v) => to_f64(key, v).map(Some),
        }
    }

    fn status_opt_i64(&self, key: &str) -> Result<Option<i64>, ClientError> {
        match self.status.get(key) {
            None | Some(Value::Null) | Some(Value::Bool(false)) => Ok(None),
            Some(v) => to_i64(key, v).map(Some),
        }
    }

    // Identity

    pub fn serial(&self) -> Option<String> {
        self.config
            .get("wifi_serial")
            .and_then(|v| to_string("wifi_serial", v).ok())
            .filter(|s| !s.is_empty())
    }

    pub fn model(&self) -> String {
        self.config
            .get("buildenv")
            .and_then(|v| to_string("buildenv", v).ok())
            .unwrap_or_else(|| "unknown".to_string())
    }

    // Charger state

    pub fn status(&self) -> Result<String, ClientError> {
        match self.status.get("status") {
            Some(v) => to_string("status", v),
            None => self.state(),
        }
    }

    pub fn state(&self) -> Result<String, ClientError> {
        match self.status_field("state")? {
            Value::String(s) => Ok(s.to_lowercase()),
            other => {
                let code = to_i64("state", other)?;
                STATES
                    .iter()
                    .find(|(c, _)| *c == code)
                    .map(|(_, name)| name.to_string())
                    .ok_or_else(|| ClientError::invalid("state", format!("unknown code {}", code)))
            }
        }
    }

    pub fn charge_time_elapsed(&self) -> Result<i64, ClientError> {
        self.status_i64("elapsed")
    }

    // Temperatures are reported in tenths of a degree.

    pub fn ambient_temperature(&self) -> Result<Option<f64>, ClientError> {
        let raw = match self.status_opt_f64("temp")? {
            Some(t) => Some(t),
            None => self.status_opt_f64("temp1")?,
        };
        Ok(raw.map(|t| round_to(t / 10.0, 2)))
    }

    pub fn rtc_temperature(&self) -> Result<Option<f64>, ClientError> {
        Ok(self.status_opt_f64("temp1")?.map(|t| round_to(t / 10.0, 2)))
    }

    pub fn ir_temperature(&self) -> Result<Option<f64>, ClientError> {
        Ok(self.status_opt_f64("temp3")?.map(|t| round_to(t / 10.0, 2)))
    }

    pub fn esp_temperature(&self) -> Result<Option<f64>, ClientError> {
        Ok(self.status_opt_f64("temp4")?.map(|t| round_to(t / 10.0, 2)))
    }

    // Energy

    /// Energy used this session, in Wh.
    pub fn usage_session(&self) -> Result<f64, ClientError> {
        if let Some(v) = self.status.get("session_energy") {
            return to_f64("session_energy", v).map(|wh| round_to(wh, 2));
        }
        Ok(round_to(self.status_f64("wattsec")? / 3600.0, 2))
    }

    /// Lifetime energy, in kWh.
    pub fn usage_total(&self) -> Result<f64, ClientError> {
        if let Some(v) = self.status.get("total_energy") {
            return to_f64("total_energy", v).map(|kwh| round_to(kwh, 3));
        }
        Ok(round_to(self.status_f64("watthour")? / 1000.0, 3))
    }

    pub fn total_day(&self) -> Result<f64, ClientError> {
        self.status_f64("total_day").map(|v| round_to(v, 3))
    }

    pub fn total_week(&self) -> Result<f64, ClientError> {
        self.status_f64("total_week").map(|v| round_to(v, 3))
    }

    pub fn total_month(&self) -> Result<f64, ClientError> {
        self.status_f64("total_month").map(|v| round_to(v, 3))
    }

    pub fn total_year(&self) -> Result<f64, ClientError> {
        self.status_f64("total_year").map(|v| round_to(v, 3))
    }

    // Firmware

    pub fn openevse_firmware(&self) -> Result<String, ClientError> {
        self.config_str("firmware")
    }

    pub fn protocol_version(&self) -> Result<Option<String>, ClientError> {
        let protocol = self.config_str("protocol")?;
        Ok(if protocol == "-" { None } else { Some(protocol) })
    }

    pub fn wifi_firmware(&self) -> Result<String, ClientError> {
        self.config_str("version")
    }

    // Electrical

    pub fn charging_voltage(&self) -> Result<f64, ClientError> {
        self.status_f64("voltage")
    }

    /// Charging current in mA.
    pub fn charging_current(&self) -> Result<f64, ClientError> {
        self.status_f64("amp")
    }

    /// Calculated power in mW (volts times milliamps).
    pub fn charging_power(&self) -> Result<f64, ClientError> {
        Ok(round_to(
            self.charging_voltage()? * self.charging_current()?,
            2,
        ))
    }

    /// Power as measured by the charger, in W.
    pub fn current_power(&self) -> Result<f64, ClientError> {
        self.status_f64("power")
    }

    pub fn service_level(&self) -> Result<String, ClientError> {
        self.config_str("service")
    }

    pub fn max_amps(&self) -> Result<i64, ClientError> {
        self.config_i64("max_current_hard")
    }

    pub fn min_amps(&self) -> Result<i64, ClientError> {
        self.config_i64("min_current_hard")
    }

    pub fn current_capacity(&self) -> Result<i64, ClientError> {
        self.status_i64("pilot")
    }

    pub fn max_current_soft(&self) -> Result<i64, ClientError> {
        match self.config.get("max_current_soft") {
            Some(v) => to_i64("max_current_soft", v),
            None => self.status_i64("pilot"),
        }
    }

    pub fn max_current(&self) -> Result<i64, ClientError> {
        self.status_i64("max_current")
    }

    pub fn wifi_signal(&self) -> Result<i64, ClientError> {
        self.status_i64("srssi")
    }

    pub fn ammeter_scale_factor(&self) -> Result<i64, ClientError> {
        self.config_i64("scale")
    }

    // Solar divert

    pub fn divertmode(&self) -> Result<String, ClientError> {
        match self.status_i64("divertmode")? {
            1 => Ok("fast".to_string()),
            2 => Ok("eco".to_string()),
            other => Err(ClientError::invalid(
                "divertmode",
                format!("unknown mode {}", other),
            )),
        }
    }

    pub fn available_current(&self) -> Result<f64, ClientError> {
        self.status_f64("available_current")
    }

    pub fn smoothed_available_current(&self) -> Result<f64, ClientError> {
        self.status_f64("smoothed_available_current")
    }

    pub fn charge_rate(&self) -> Result<f64, ClientError> {
        self.status_f64("charge_rate")
    }

    // Load shaper

    pub fn shaper_live_power(&self) -> Result<i64, ClientError> {
        self.status_i64("shaper_live_pwr")
    }

    pub fn shaper_available_current(&self) -> Result<f64, ClientError> {
        let current = self.status_i64("shaper_cur")?;
        if current == SHAPER_UNLIMITED {
            return self.max_current_soft().map(|c| c as f64);
        }
        Ok(current as f64)
    }

    pub fn shaper_max_power(&self) -> Result<Option<i64>, ClientError> {
        self.status_opt_i64("shaper_max_pwr")
    }

    // Vehicle

    pub fn vehicle_soc(&self) -> Result<Option<i64>, ClientError> {
        self.status_opt_i64("battery_level")
    }

    pub fn vehicle_range(&self) -> Result<Option<i64>, ClientError> {
        self.status_opt_i64("battery_range")
    }

    /// Estimated completion time, derived from `time_to_full_charge` relative
    /// to when the readings were last refreshed.
    pub fn vehicle_eta(&self) -> Result<Option<DateTime<Utc>>, ClientError> {
        Ok(self
            .status_opt_i64("time_to_full_charge")?
            .map(|secs| self.updated_at + Duration::seconds(secs)))
    }

    // Flags

    pub fn ota_update(&self) -> Result<bool, ClientError> {
        self.status_bool("ota_update")
    }

    pub fn vehicle(&self) -> Result<bool, ClientError> {
        self.status_bool("vehicle")
    }

    pub fn manual_override(&self) -> Result<bool, ClientError> {
        self.require("manual_override", "4.0.0")?;
        self.status_bool("manual_override")
    }

    pub fn divert_active(&self) -> Result<bool, ClientError> {
        self.status_bool("divert_active")
    }

    pub fn using_ethernet(&self) -> Result<bool, ClientError> {
        self.status_bool("eth_connected")
    }

    pub fn shaper_active(&self) -> Result<bool, ClientError> {
        self.require("shaper_active", "4.0.0")?;
        self.status_bool("shaper")
    }

    pub fn has_limit(&self) -> Result<bool, ClientError> {
        self.require("has_limit", "4.1.0")?;
        self.status_bool("has_limit")
    }

    pub fn mqtt_connected(&self) -> Result<bool, ClientError> {
        self.status_bool("mqtt_connected")
    }

    pub fn shaper_updated(&self) -> Result<bool, ClientError> {
        self.require("shaper_updated", "4.1.0")?;
        self.status_bool("shaper_updated")
    }

    pub fn led_brightness(&self) -> Result<i64, ClientError> {
        self.require("led_brightness", "4.1.0")?;
        self.config_i64("led_brightness")
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

fn to_f64(field: &str, v: &Value) -> Result<f64, ClientError> {
    match v {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ClientError::invalid(field, "not a finite number")),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| ClientError::invalid(field, format!("'{}' is not numeric", s))),
        other => Err(ClientError::invalid(
            field,
            format!("expected a number, got {}", other),
        )),
    }
}

fn to_i64(field: &str, v: &Value) -> Result<i64, ClientError> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .ok_or_else(|| ClientError::invalid(field, "not an integer")),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| ClientError::invalid(field, format!("'{}' is not an integer", s))),
        Value::Bool(b) => Ok(i64::from(*b)),
        other => Err(ClientError::invalid(
            field,
            format!("expected an integer, got {}", other),
        )),
    }
}

fn to_bool(field: &str, v: &Value) -> Result<bool, ClientError> {
    match v {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "on" => Ok(true),
            "false" | "0" | "off" | "" => Ok(false),
            _ => Err(ClientError::invalid(field, format!("'{}' is not a flag", s))),
        },
        other => Err(ClientError::invalid(
            field,
            format!("expected a flag, got {}", other),
        )),
    }
}

fn to_string(field: &str, v: &Value) -> Result<String, ClientError> {
    match v {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(ClientError::invalid(
            field,
            format!("expected a string, got {}", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn readings(status: Value, config: Value) -> Readings {
        Readings::new(
            status.as_object().cloned().unwrap_or_default(),
            config.as_object().cloned().unwrap_or_default(),
        )
    }

    fn charger() -> Readings {
        readings(
            json!({
                "state": 254,
                "elapsed": 17832,
                "temp": 296,
                "temp1": 296,
                "temp3": false,
                "temp4": 322.5,
                "wattsec": 106234272,
                "watthour": 64582,
                "voltage": 240,
                "amp": 0,
                "pilot": 48,
                "srssi": -66,
                "divertmode": 2,
                "shaper_cur": 255,
                "vehicle": 0,
                "eth_connected": false,
                "divert_active": true,
                "has_limit": 1,
            }),
            json!({
                "firmware": "7.1.3",
                "protocol": "-",
                "version": "4.1.7",
                "service": 2,
                "max_current_hard": 48,
                "min_current_hard": 6,
                "max_current_soft": 32,
                "scale": 220,
                "wifi_serial": "1234567890AB",
                "buildenv": "openevse_wifi_v1",
                "led_brightness": 125,
            }),
        )
    }

    #[test]
    fn test_state_codes_map_to_names() {
        let r = charger();
        assert_eq!(r.state().unwrap(), "sleeping");
        // No explicit status field falls back to the state name
        assert_eq!(r.status().unwrap(), "sleeping");

        let r = readings(json!({"state": "Sleeping", "status": "disabled"}), json!({}));
        assert_eq!(r.state().unwrap(), "sleeping");
        assert_eq!(r.status().unwrap(), "disabled");

        let r = readings(json!({"state": 77}), json!({}));
        assert!(matches!(r.state(), Err(ClientError::InvalidField { .. })));
    }

    #[test]
    fn test_temperatures_scaled_and_optional() {
        let r = charger();
        assert_eq!(r.ambient_temperature().unwrap(), Some(29.6));
        assert_eq!(r.rtc_temperature().unwrap(), Some(29.6));
        assert_eq!(r.ir_temperature().unwrap(), None);
        assert_eq!(r.esp_temperature().unwrap(), Some(32.25));
    }

    #[test]
    fn test_energy_units() {
        let r = charger();
        assert_eq!(r.usage_total().unwrap(), 64.582);
        assert_eq!(r.usage_session().unwrap(), 29509.52);

        let r = readings(json!({"total_energy": 12.5}), json!({}));
        assert_eq!(r.usage_total().unwrap(), 12.5);
    }

    #[test]
    fn test_missing_and_invalid_fields() {
        let r = charger();
        assert!(matches!(
            r.current_power(),
            Err(ClientError::MissingField(ref k)) if k == "power"
        ));

        let r = readings(json!({"voltage": "n/a"}), json!({}));
        assert!(matches!(
            r.charging_voltage(),
            Err(ClientError::InvalidField { .. })
        ));
    }

    #[test]
    fn test_config_derived_properties() {
        let r = charger();
        assert_eq!(r.openevse_firmware().unwrap(), "7.1.3");
        assert_eq!(r.protocol_version().unwrap(), None);
        assert_eq!(r.wifi_firmware().unwrap(), "4.1.7");
        assert_eq!(r.service_level().unwrap(), "2");
        assert_eq!(r.max_amps().unwrap(), 48);
        assert_eq!(r.min_amps().unwrap(), 6);
        assert_eq!(r.max_current_soft().unwrap(), 32);
        assert_eq!(r.serial().as_deref(), Some("1234567890AB"));
        assert_eq!(r.model(), "openevse_wifi_v1");
    }

    #[test]
    fn test_divert_and_shaper() {
        let r = charger();
        assert_eq!(r.divertmode().unwrap(), "eco");
        assert!(r.divert_active().unwrap());
        // 255 means "unlimited" and reports the soft limit instead
        assert_eq!(r.shaper_available_current().unwrap(), 32.0);
    }

    #[test]
    fn test_flags_accept_numbers() {
        let r = charger();
        assert!(!r.vehicle().unwrap());
        assert!(!r.using_ethernet().unwrap());
        assert!(r.has_limit().unwrap());
    }

    #[test]
    fn test_version_gated_properties() {
        let r = charger();
        assert_eq!(r.led_brightness().unwrap(), 125);

        let old = readings(json!({"has_limit": 0}), json!({"version": "3.5.2", "led_brightness": 50}));
        assert!(matches!(
            old.led_brightness(),
            Err(ClientError::UnsupportedFeature(_))
        ));
        assert!(matches!(
            old.has_limit(),
            Err(ClientError::UnsupportedFeature(_))
        ));
        assert!(old.version_check("3.0.0"));
        assert!(!old.version_check("4.1.0"));
    }

    #[test]
    fn test_merge_status_overlays_fields() {
        let mut r = charger();
        let frame = json!({"amp": 16000, "state": 3});
        r.merge_status(frame.as_object().cloned().unwrap());
        assert_eq!(r.state().unwrap(), "charging");
        assert_eq!(r.charging_power().unwrap(), 3_840_000.0);
        // Untouched fields survive
        assert_eq!(r.charge_time_elapsed().unwrap(), 17832);
    }

    #[test]
    fn test_vehicle_eta_relative_to_refresh() {
        let mut r = readings(json!({"time_to_full_charge": 3600}), json!({}));
        let eta = r.vehicle_eta().unwrap().unwrap();
        assert_eq!(eta - r.updated_at, Duration::seconds(3600));

        r.merge_status(json!({"time_to_full_charge": null}).as_object().cloned().unwrap());
        assert_eq!(r.vehicle_eta().unwrap(), None);
    }
}
