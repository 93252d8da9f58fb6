//! Static entity tables.

use super::accessor::Attribute;
use super::accessor::Suppress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum EntityCategory {
    Config,
    Diagnostic,
}

/// Metadata shared by every platform.
#[derive(Debug, Clone, Copy)]
pub struct EntityDescription {
    /// Table key, used in unique ids
    pub key: &'static str,
    pub attribute: Attribute,
    pub name: &'static str,
    pub icon: Option<&'static str>,
    pub device_class: Option<&'static str>,
    pub entity_category: Option<EntityCategory>,
    /// Oldest gateway firmware providing the value
    pub min_version: Option<&'static str>,
}

impl EntityDescription {
    const fn new(key: &'static str, attribute: Attribute, name: &'static str) -> Self {
        Self {
            key,
            attribute,
            name,
            icon: None,
            device_class: None,
            entity_category: None,
            min_version: None,
        }
    }

    const fn icon(mut self, icon: &'static str) -> Self {
        self.icon = Some(icon);
        self
    }

    const fn class(mut self, device_class: &'static str) -> Self {
        self.device_class = Some(device_class);
        self
    }

    const fn diagnostic(mut self) -> Self {
        self.entity_category = Some(EntityCategory::Diagnostic);
        self
    }

    const fn config(mut self) -> Self {
        self.entity_category = Some(EntityCategory::Config);
        self
    }

    const fn since(mut self, version: &'static str) -> Self {
        self.min_version = Some(version);
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SensorDescription {
    pub base: EntityDescription,
    pub unit: Option<&'static str>,
    pub state_class: Option<&'static str>,
    pub display_precision: Option<u8>,
}

impl SensorDescription {
    const fn new(base: EntityDescription) -> Self {
        Self {
            base,
            unit: None,
            state_class: None,
            display_precision: None,
        }
    }

    const fn unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }

    const fn measurement(mut self) -> Self {
        self.state_class = Some("measurement");
        self
    }

    const fn total_increasing(mut self) -> Self {
        self.state_class = Some("total_increasing");
        self
    }

    const fn precision(mut self, digits: u8) -> Self {
        self.display_precision = Some(digits);
        self
    }
}

/// How a switch flips its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleCommand {
    ToggleOverride,
    Claim,
    DivertMode,
}

#[derive(Debug, Clone, Copy)]
pub struct SwitchDescription {
    pub base: EntityDescription,
    pub toggle: ToggleCommand,
}

/// Write path shared by the charge-rate select and number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectCommand {
    SetCurrent,
    Override,
    SetDivertMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectOptions {
    Fixed(&'static [&'static str]),
    /// `min_amps..=max_amps` from the cache
    ChargeRange,
}

#[derive(Debug, Clone, Copy)]
pub struct SelectDescription {
    pub base: EntityDescription,
    pub options: SelectOptions,
    pub command: SelectCommand,
}

#[derive(Debug, Clone, Copy)]
pub struct NumberDescription {
    pub base: EntityDescription,
    pub unit: &'static str,
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonAction {
    RestartWifi,
    RestartEvse,
}

/// Buttons read nothing from the cache; they are restart actions in the
/// config category.
#[derive(Debug, Clone, Copy)]
pub struct ButtonDescription {
    pub key: &'static str,
    pub name: &'static str,
    pub action: ButtonAction,
}

pub const OVERRIDE_STATES: &[&str] = &["active", "auto", "disabled"];
pub const DIVERT_MODES: &[&str] = &["fast", "eco"];

const ENERGY_TOTALS_SINCE: &str = "3.0.0";

const fn energy_total(key: &'static str, attribute: Attribute, name: &'static str) -> SensorDescription {
    SensorDescription::new(
        EntityDescription::new(key, attribute, name)
            .class("energy")
            .since(ENERGY_TOTALS_SINCE),
    )
    .unit("kWh")
    .total_increasing()
}

const fn temperature(key: &'static str, attribute: Attribute, name: &'static str) -> SensorDescription {
    SensorDescription::new(
        EntityDescription::new(key, attribute, name).class("temperature"),
    )
    .unit("°C")
    .measurement()
}

pub const SENSORS: &[SensorDescription] = &[
    SensorDescription::new(
        EntityDescription::new("status", Attribute::Status, "Station Status").icon("mdi:ev-station"),
    ),
    SensorDescription::new(EntityDescription::new("state", Attribute::State, "Charging Status")),
    SensorDescription::new(
        EntityDescription::new("charge_time_elapsed", Attribute::ChargeTimeElapsed, "Charge Time Elapsed")
            .icon("mdi:camera-timer")
            .class("duration")
            .diagnostic(),
    )
    .unit("s")
    .precision(1),
    temperature("ambient_temperature", Attribute::AmbientTemperature, "Ambient Temperature"),
    temperature("ir_temperature", Attribute::IrTemperature, "IR Temperature"),
    temperature("rtc_temperature", Attribute::RtcTemperature, "RTC Temperature"),
    temperature("esp_temperature", Attribute::EspTemperature, "ESP32 Temperature"),
    SensorDescription::new(
        EntityDescription::new("usage_session", Attribute::UsageSession, "Usage this Session")
            .class("energy"),
    )
    .unit("Wh")
    .total_increasing()
    .precision(1),
    SensorDescription::new(
        EntityDescription::new("usage_total", Attribute::UsageTotal, "Total Usage")
            .class("energy"),
    )
    .unit("kWh")
    .total_increasing()
    .precision(1),
    SensorDescription::new(
        EntityDescription::new("openevse_firmware", Attribute::OpenevseFirmware, "Controller Firmware")
            .icon("mdi:package-up")
            .diagnostic(),
    ),
    SensorDescription::new(
        EntityDescription::new("protocol_version", Attribute::ProtocolVersion, "Protocol Version")
            .icon("mdi:package-up")
            .diagnostic(),
    ),
    SensorDescription::new(
        EntityDescription::new("charging_voltage", Attribute::ChargingVoltage, "Charging Voltage")
            .icon("mdi:sine-wave")
            .class("voltage"),
    )
    .unit("V")
    .measurement()
    .precision(1),
    SensorDescription::new(
        EntityDescription::new("charging_current", Attribute::ChargingCurrent, "Charging Current")
            .icon("mdi:sine-wave")
            .class("current"),
    )
    .unit("mA")
    .measurement()
    .precision(1),
    SensorDescription::new(
        EntityDescription::new("service_level", Attribute::ServiceLevel, "Service Level")
            .icon("mdi:leaf")
            .diagnostic(),
    ),
    SensorDescription::new(
        EntityDescription::new("max_amps", Attribute::MaxAmps, "Max Amps")
            .icon("mdi:sine-wave")
            .class("current")
            .diagnostic(),
    )
    .unit("A"),
    SensorDescription::new(
        EntityDescription::new("min_amps", Attribute::MinAmps, "Min Amps")
            .icon("mdi:sine-wave")
            .class("current")
            .diagnostic(),
    )
    .unit("A"),
    SensorDescription::new(
        EntityDescription::new("current_capacity", Attribute::CurrentCapacity, "Current Capacity")
            .icon("mdi:sine-wave")
            .class("current")
            .diagnostic(),
    )
    .unit("A"),
    SensorDescription::new(
        EntityDescription::new("wifi_firmware", Attribute::WifiFirmware, "WiFi Firmware Version")
            .icon("mdi:package-up")
            .diagnostic(),
    ),
    SensorDescription::new(
        EntityDescription::new(
            "charging_power",
            Attribute::ChargingPower,
            "Current Power Usage (Calculated)",
        )
        .icon("mdi:flash")
        .class("power"),
    )
    .unit("mW")
    .measurement()
    .precision(1),
    SensorDescription::new(
        EntityDescription::new("wifi_signal", Attribute::WifiSignal, "WiFi Signal Strength")
            .icon("mdi:wifi")
            .class("signal_strength")
            .diagnostic(),
    )
    .unit("dB"),
    SensorDescription::new(
        EntityDescription::new("ammeter_scale_factor", Attribute::AmmeterScaleFactor, "Sensor Scale")
            .icon("mdi:scale")
            .diagnostic(),
    ),
    SensorDescription::new(
        EntityDescription::new("divertmode", Attribute::Divertmode, "Divert Mode")
            .icon("mdi:solar-power")
            .diagnostic(),
    ),
    SensorDescription::new(
        EntityDescription::new("available_current", Attribute::AvailableCurrent, "PV Available Current")
            .icon("mdi:sine-wave")
            .class("current"),
    )
    .unit("A")
    .measurement()
    .precision(1),
    SensorDescription::new(
        EntityDescription::new(
            "smoothed_available_current",
            Attribute::SmoothedAvailableCurrent,
            "PV Smoothed Available Current",
        )
        .icon("mdi:sine-wave")
        .class("current"),
    )
    .unit("A")
    .measurement()
    .precision(1),
    SensorDescription::new(
        EntityDescription::new("charge_rate", Attribute::ChargeRate, "PV Charge Rate")
            .icon("mdi:sine-wave")
            .class("current"),
    )
    .unit("A")
    .measurement(),
    SensorDescription::new(
        EntityDescription::new("shaper_live_power", Attribute::ShaperLivePower, "Shaper Power")
            .icon("mdi:flash")
            .class("power")
            .since("4.1.0"),
    )
    .unit("W")
    .measurement(),
    SensorDescription::new(
        EntityDescription::new(
            "shaper_available_current",
            Attribute::ShaperAvailableCurrent,
            "Shaper Current Available",
        )
        .icon("mdi:flash")
        .class("current")
        .since("4.1.0"),
    )
    .unit("A")
    .measurement(),
    SensorDescription::new(
        EntityDescription::new("shaper_max_power", Attribute::ShaperMaxPower, "Shaper Max Power")
            .icon("mdi:flash")
            .class("power")
            .since("4.1.0"),
    )
    .unit("W")
    .measurement(),
    SensorDescription::new(
        EntityDescription::new("vehicle_soc", Attribute::VehicleSoc, "Vehicle Battery Level")
            .icon("mdi:battery")
            .class("battery")
            .since("4.1.0"),
    )
    .unit("%")
    .measurement(),
    SensorDescription::new(
        EntityDescription::new("vehicle_range", Attribute::VehicleRange, "Vehicle Range")
            .icon("mdi:ev-station")
            .class("distance")
            .since("4.1.0"),
    )
    .unit("km")
    .measurement(),
    SensorDescription::new(
        EntityDescription::new("vehicle_eta", Attribute::VehicleEta, "Vehicle Charge Completion")
            .icon("mdi:car-electric")
            .class("timestamp")
            .since("4.1.0"),
    ),
    energy_total("total_day", Attribute::TotalDay, "Usage (Today)"),
    energy_total("total_week", Attribute::TotalWeek, "Usage (Week)"),
    energy_total("total_month", Attribute::TotalMonth, "Usage (Month)"),
    energy_total("total_year", Attribute::TotalYear, "Usage (Year)"),
    SensorDescription::new(
        EntityDescription::new("max_current", Attribute::MaxCurrent, "Max Current")
            .class("current")
            .diagnostic(),
    )
    .unit("A")
    .measurement(),
    SensorDescription::new(
        EntityDescription::new("override_state", Attribute::OverrideState, "Override State")
            .diagnostic()
            .since("4.1.0"),
    ),
    SensorDescription::new(
        EntityDescription::new("current_power", Attribute::CurrentPower, "Current Power Usage (Actual)")
            .icon("mdi:flash")
            .class("power")
            .since("4.2.2"),
    )
    .unit("W")
    .measurement()
    .precision(1),
];

pub const BINARY_SENSORS: &[EntityDescription] = &[
    EntityDescription::new("ota_update", Attribute::OtaUpdate, "OTA Update")
        .class("update")
        .diagnostic(),
    EntityDescription::new("vehicle", Attribute::Vehicle, "Vehicle Connected").class("plug"),
    EntityDescription::new("manual_override", Attribute::ManualOverride, "Manual Override")
        .class("power"),
    EntityDescription::new("divert_active", Attribute::DivertActive, "Divert Active").class("power"),
    EntityDescription::new("using_ethernet", Attribute::UsingEthernet, "Ethernet Connected")
        .class("connectivity")
        .diagnostic(),
    EntityDescription::new("shaper_active", Attribute::ShaperActive, "Shaper Active").class("power"),
    EntityDescription::new("has_limit", Attribute::HasLimit, "Limit Active").class("power"),
    EntityDescription::new("mqtt_connected", Attribute::MqttConnected, "MQTT Connected")
        .class("connectivity")
        .diagnostic(),
    EntityDescription::new("shaper_updated", Attribute::ShaperUpdated, "Shaper Updated").diagnostic(),
];

pub const SWITCHES: &[SwitchDescription] = &[
    SwitchDescription {
        base: EntityDescription::new("sleep_mode", Attribute::State, "Sleep Mode").class("switch"),
        toggle: ToggleCommand::ToggleOverride,
    },
    SwitchDescription {
        base: EntityDescription::new("sleep_mode_new", Attribute::State, "Sleep Mode (new)")
            .class("switch")
            .since("4.1.0"),
        toggle: ToggleCommand::Claim,
    },
    SwitchDescription {
        base: EntityDescription::new("manual_override", Attribute::ManualOverride, "Manual Override")
            .class("switch")
            .since("4.1.0"),
        toggle: ToggleCommand::ToggleOverride,
    },
    SwitchDescription {
        base: EntityDescription::new("divertmode", Attribute::DivertActive, "Solar PV Divert")
            .class("switch")
            .since("4.1.0"),
        toggle: ToggleCommand::DivertMode,
    },
];

pub const SELECTS: &[SelectDescription] = &[
    SelectDescription {
        base: EntityDescription::new("max_current_soft", Attribute::MaxCurrentSoft, "Charge Rate")
            .config(),
        options: SelectOptions::ChargeRange,
        command: SelectCommand::SetCurrent,
    },
    SelectDescription {
        base: EntityDescription::new("override_state", Attribute::OverrideState, "Override State")
            .config()
            .since("4.1.0"),
        options: SelectOptions::Fixed(OVERRIDE_STATES),
        command: SelectCommand::Override,
    },
    SelectDescription {
        base: EntityDescription::new("divertmode", Attribute::Divertmode, "Divert Mode"),
        options: SelectOptions::Fixed(DIVERT_MODES),
        command: SelectCommand::SetDivertMode,
    },
];

pub const NUMBERS: &[NumberDescription] = &[NumberDescription {
    base: EntityDescription::new("max_current_soft", Attribute::MaxCurrentSoft, "Charge Rate")
        .class("current")
        .config(),
    unit: "A",
    min: 6.0,
    max: 48.0,
    step: 1.0,
}];

pub const LIGHTS: &[EntityDescription] = &[EntityDescription::new(
    "led_brightness",
    Attribute::LedBrightness,
    "LED Brightness",
)
.config()
.since("4.1.0")];

pub const BUTTONS: &[ButtonDescription] = &[
    ButtonDescription {
        key: "restart_wifi",
        name: "Restart WiFi",
        action: ButtonAction::RestartWifi,
    },
    ButtonDescription {
        key: "restart_evse",
        name: "Restart EVSE",
        action: ButtonAction::RestartEvse,
    },
];

/// Icon for the charging status sensor.
pub fn status_icon(state: &str) -> &'static str {
    match state {
        "unknown" => "mdi:help",
        "not connected" => "mdi:power-plug-off",
        "connected" => "mdi:power-plug",
        "charging" => "mdi:battery-charging",
        "sleeping" => "mdi:sleep",
        "disabled" => "mdi:car-off",
        _ => "mdi:alert-octagon",
    }
}

/// One table walked by the coordinator when it rebuilds the cache.
pub struct ParsedTable {
    pub name: &'static str,
    pub attributes: Vec<Attribute>,
    pub suppress: Suppress,
    /// Values are coerced to booleans
    pub binary: bool,
}

/// The four tables feeding the cache, in walk order.
pub fn parsed_tables() -> Vec<ParsedTable> {
    vec![
        ParsedTable {
            name: "sensor",
            attributes: SENSORS.iter().map(|d| d.base.attribute).collect(),
            suppress: Suppress::ReadErrors,
            binary: false,
        },
        ParsedTable {
            name: "binary_sensor",
            attributes: BINARY_SENSORS.iter().map(|d| d.attribute).collect(),
            suppress: Suppress::ReadOrUnsupported,
            binary: true,
        },
        ParsedTable {
            name: "select",
            attributes: SELECTS.iter().map(|d| d.base.attribute).collect(),
            suppress: Suppress::ReadOrUnsupported,
            binary: false,
        },
        ParsedTable {
            name: "light",
            attributes: LIGHTS.iter().map(|d| d.attribute).collect(),
            suppress: Suppress::ReadOrUnsupported,
            binary: false,
        },
    ]
}
