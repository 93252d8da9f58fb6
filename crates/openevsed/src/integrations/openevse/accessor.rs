//! Typed access to every charger attribute the entities read.
//!
//! Each `Attribute` names one key of the coordinator cache and knows how to
//! read it, either straight off the latest `Readings` or through an extra
//! request to the charger.

use openevse_http::ClientError;
use openevse_http::Readings;
use serde_json::Value;
use serde_json::json;

use super::charger::Charger;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum Attribute {
    Status,
    State,
    ChargeTimeElapsed,
    AmbientTemperature,
    IrTemperature,
    RtcTemperature,
    EspTemperature,
    UsageSession,
    UsageTotal,
    TotalDay,
    TotalWeek,
    TotalMonth,
    TotalYear,
    OpenevseFirmware,
    ProtocolVersion,
    WifiFirmware,
    ChargingVoltage,
    ChargingCurrent,
    ChargingPower,
    CurrentPower,
    ServiceLevel,
    MaxAmps,
    MinAmps,
    CurrentCapacity,
    MaxCurrentSoft,
    MaxCurrent,
    WifiSignal,
    AmmeterScaleFactor,
    Divertmode,
    AvailableCurrent,
    SmoothedAvailableCurrent,
    ChargeRate,
    ShaperLivePower,
    ShaperAvailableCurrent,
    ShaperMaxPower,
    VehicleSoc,
    VehicleRange,
    VehicleEta,
    OverrideState,
    OtaUpdate,
    Vehicle,
    ManualOverride,
    DivertActive,
    UsingEthernet,
    ShaperActive,
    HasLimit,
    MqttConnected,
    ShaperUpdated,
    LedBrightness,
}

/// Values that need their own round trip to the charger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncAttribute {
    OverrideState,
    ChargeCurrent,
}

impl AsyncAttribute {
    pub async fn read(self, charger: &dyn Charger) -> Result<Value, ClientError> {
        match self {
            AsyncAttribute::OverrideState => charger.override_state().await.map(Value::from),
            AsyncAttribute::ChargeCurrent => charger.charge_current().await.map(Value::from),
        }
    }
}

pub type SyncRead = fn(&Readings) -> Result<Value, ClientError>;

#[derive(Clone, Copy)]
pub enum Accessor {
    Sync(SyncRead),
    Async(AsyncAttribute),
}

macro_rules! read {
    ($getter:ident) => {
        Accessor::Sync(|r: &Readings| r.$getter().map(|v| json!(v)))
    };
}

impl Attribute {
    /// Cache key, identical to the attribute's snake_case name.
    pub fn key(self) -> &'static str {
        self.into()
    }

    pub fn accessor(self) -> Accessor {
        match self {
            Attribute::Status => read!(status),
            Attribute::State => read!(state),
            Attribute::ChargeTimeElapsed => read!(charge_time_elapsed),
            Attribute::AmbientTemperature => read!(ambient_temperature),
            Attribute::IrTemperature => read!(ir_temperature),
            Attribute::RtcTemperature => read!(rtc_temperature),
            Attribute::EspTemperature => read!(esp_temperature),
            Attribute::UsageSession => read!(usage_session),
            Attribute::UsageTotal => read!(usage_total),
            Attribute::TotalDay => read!(total_day),
            Attribute::TotalWeek => read!(total_week),
            Attribute::TotalMonth => read!(total_month),
            Attribute::TotalYear => read!(total_year),
            Attribute::OpenevseFirmware => read!(openevse_firmware),
            Attribute::ProtocolVersion => read!(protocol_version),
            Attribute::WifiFirmware => read!(wifi_firmware),
            Attribute::ChargingVoltage => read!(charging_voltage),
            Attribute::ChargingCurrent => read!(charging_current),
            Attribute::ChargingPower => read!(charging_power),
            Attribute::CurrentPower => read!(current_power),
            Attribute::ServiceLevel => read!(service_level),
            Attribute::MaxAmps => read!(max_amps),
            Attribute::MinAmps => read!(min_amps),
            Attribute::CurrentCapacity => read!(current_capacity),
            Attribute::MaxCurrentSoft => Accessor::Async(AsyncAttribute::ChargeCurrent),
            Attribute::MaxCurrent => read!(max_current),
            Attribute::WifiSignal => read!(wifi_signal),
            Attribute::AmmeterScaleFactor => read!(ammeter_scale_factor),
            Attribute::Divertmode => read!(divertmode),
            Attribute::AvailableCurrent => read!(available_current),
            Attribute::SmoothedAvailableCurrent => read!(smoothed_available_current),
            Attribute::ChargeRate => read!(charge_rate),
            Attribute::ShaperLivePower => read!(shaper_live_power),
            Attribute::ShaperAvailableCurrent => read!(shaper_available_current),
            Attribute::ShaperMaxPower => read!(shaper_max_power),
            Attribute::VehicleSoc => read!(vehicle_soc),
            Attribute::VehicleRange => read!(vehicle_range),
            Attribute::VehicleEta => Accessor::Sync(|r: &Readings| {
                r.vehicle_eta().map(|eta| json!(eta.map(|t| t.to_rfc3339())))
            }),
            Attribute::OverrideState => Accessor::Async(AsyncAttribute::OverrideState),
            Attribute::OtaUpdate => read!(ota_update),
            Attribute::Vehicle => read!(vehicle),
            Attribute::ManualOverride => read!(manual_override),
            Attribute::DivertActive => read!(divert_active),
            Attribute::UsingEthernet => read!(using_ethernet),
            Attribute::ShaperActive => read!(shaper_active),
            Attribute::HasLimit => read!(has_limit),
            Attribute::MqttConnected => read!(mqtt_connected),
            Attribute::ShaperUpdated => read!(shaper_updated),
            Attribute::LedBrightness => read!(led_brightness),
        }
    }
}

/// Which read failures a table tolerates without complaint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppress {
    /// Missing or malformed fields
    ReadErrors,
    /// Read errors plus features the firmware lacks
    ReadOrUnsupported,
}

impl Suppress {
    pub fn covers(self, err: &ClientError) -> bool {
        match self {
            Suppress::ReadErrors => err.is_read_suppressible(),
            Suppress::ReadOrUnsupported => {
                err.is_read_suppressible() || matches!(err, ClientError::UnsupportedFeature(_))
            }
        }
    }
}

/// Truthiness used for binary sensor values.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Null => false,
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use serde_json::Map;

    use super::*;

    fn readings(status: Value, config: Value) -> Readings {
        let object = |v: Value| match v {
            Value::Object(m) => m,
            _ => Map::new(),
        };
        Readings::new(object(status), object(config))
    }

    fn sync_read(attribute: Attribute, r: &Readings) -> Result<Value, ClientError> {
        match attribute.accessor() {
            Accessor::Sync(read) => read(r),
            Accessor::Async(_) => panic!("{} is async", attribute),
        }
    }

    #[test]
    fn test_keys_round_trip_through_names() {
        for (attribute, key) in [
            (Attribute::Divertmode, "divertmode"),
            (Attribute::OpenevseFirmware, "openevse_firmware"),
            (Attribute::IrTemperature, "ir_temperature"),
            (Attribute::MaxCurrentSoft, "max_current_soft"),
            (Attribute::VehicleSoc, "vehicle_soc"),
            (Attribute::LedBrightness, "led_brightness"),
        ] {
            assert_eq!(attribute.key(), key);
            assert_eq!(Attribute::from_str(key), Ok(attribute));
        }
    }

    #[test]
    fn test_sync_accessors_read_readings() {
        let r = readings(
            serde_json::json!({"state": 254, "total_energy": 64.582, "temp3": false}),
            serde_json::json!({"version": "4.1.2"}),
        );
        assert_eq!(sync_read(Attribute::State, &r).unwrap(), json!("sleeping"));
        assert_eq!(sync_read(Attribute::UsageTotal, &r).unwrap(), json!(64.582));
        assert_eq!(sync_read(Attribute::IrTemperature, &r).unwrap(), Value::Null);
        assert!(matches!(
            sync_read(Attribute::ChargingVoltage, &r),
            Err(ClientError::MissingField(_))
        ));
    }

    #[test]
    fn test_async_attributes() {
        assert!(matches!(
            Attribute::OverrideState.accessor(),
            Accessor::Async(AsyncAttribute::OverrideState)
        ));
        assert!(matches!(
            Attribute::MaxCurrentSoft.accessor(),
            Accessor::Async(AsyncAttribute::ChargeCurrent)
        ));
    }

    #[test]
    fn test_suppression_policy() {
        let missing = ClientError::MissingField("amp".to_string());
        let unsupported = ClientError::UnsupportedFeature("has_limit".to_string());
        let timeout = ClientError::Timeout {
            host: "x".to_string(),
        };

        assert!(Suppress::ReadErrors.covers(&missing));
        assert!(!Suppress::ReadErrors.covers(&unsupported));
        assert!(Suppress::ReadOrUnsupported.covers(&unsupported));
        assert!(!Suppress::ReadOrUnsupported.covers(&timeout));
    }

    #[test]
    fn test_truthy() {
        assert!(truthy(&json!(true)));
        assert!(truthy(&json!(1)));
        assert!(truthy(&json!("yes")));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&Value::Null));
    }
}
