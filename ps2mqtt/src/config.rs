//! Settings shared by the bridge, the relay and the controller.
use serde_derive::Deserialize;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    /// Serial numbers of the PowerStream inverters. The first one is the
    /// device the balance controller drives.
    pub powerstreams: Vec<String>,
    /// Serial numbers of the batteries reporting their state of charge.
    pub batteries: Vec<String>,
    pub powerstream_namespace: String,
    pub battery_namespace: String,
    pub heartbeat_interval_secs: u64,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            powerstreams: Vec::new(),
            batteries: Vec::new(),
            powerstream_namespace: "/sys/75".to_string(),
            battery_namespace: "/sys/72".to_string(),
            heartbeat_interval_secs: 5,
        }
    }
}

impl DevicesConfig {
    pub fn upstream_topic(&self, device_id: &str) -> String {
        format!("{}/{device_id}/thing/protobuf/upstream", self.powerstream_namespace)
    }

    pub fn command_topic(&self, device_id: &str) -> String {
        format!("{}/{device_id}/thing/property/cmd", self.powerstream_namespace)
    }

    pub fn battery_topic(&self, battery_id: &str) -> String {
        format!("{}/{battery_id}/thing/property/post", self.battery_namespace)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Topic prefix on the home automation broker.
    pub namespace: String,
    pub discovery: bool,
    pub discovery_prefix: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            namespace: "ecoflow".to_string(),
            discovery: false,
            discovery_prefix: "homeassistant".to_string(),
        }
    }
}

impl RelayConfig {
    pub fn state_topic(&self, device_id: &str) -> String {
        format!("{}/{device_id}/state", self.namespace)
    }

    pub fn setpower_topic(&self, device_id: &str) -> String {
        format!("{}/{device_id}/setpower", self.namespace)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SmartConfig {
    pub enabled: bool,
    pub meter_topic: Option<String>,
    pub enabled_topic: Option<String>,
    pub soc_topic: Option<String>,
    pub charger_topic: Option<String>,
    pub max_power: Option<i32>,
    pub balance_interval_secs: u64,
    pub charger_interval_secs: u64,
    /// Below this state of charge the inverter is switched off.
    pub low_soc_cutoff: i32,
    /// The charger is only switched on below this state of charge ...
    pub charge_below_soc: i32,
    /// ... and while exporting more than this (negative grid power).
    pub charge_export_below: i32,
    pub charger_full_soc_above: i32,
    pub charger_off_import_above: i32,
}

pub const DEFAULT_MAX_POWER: i32 = 666;

impl Default for SmartConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            meter_topic: None,
            enabled_topic: None,
            soc_topic: None,
            charger_topic: None,
            max_power: None,
            balance_interval_secs: 6,
            charger_interval_secs: 15,
            low_soc_cutoff: 13,
            charge_below_soc: 95,
            charge_export_below: -600,
            charger_full_soc_above: 99,
            charger_off_import_above: 100,
        }
    }
}

impl SmartConfig {
    pub fn max_power(&self) -> i32 {
        self.max_power.unwrap_or(DEFAULT_MAX_POWER)
    }

    pub fn is_valid(&self) -> bool {
        !self.enabled
            || [
                &self.meter_topic,
                &self.enabled_topic,
                &self.soc_topic,
                &self.charger_topic,
            ]
            .iter()
            .all(|topic| topic.as_ref().is_some_and(|t| !t.is_empty()))
    }
}
