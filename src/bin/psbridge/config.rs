use std::path::PathBuf;
use std::{env, fs};

use log::{info, warn};
use ps2mqtt::config::{DevicesConfig, RelayConfig, SmartConfig};
use ps2mqtt::mqtt_config::MqttConfig;
use serde_derive::Deserialize;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub devices: DevicesConfig,
    /// Broker the PowerStream devices talk to.
    pub ecoflow: Option<MqttConfig>,
    pub home_assistant: Option<MqttConfig>,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub smart: SmartConfig,
}

fn id_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    pub fn is_valid(&self) -> bool {
        !self.devices.powerstreams.is_empty()
            && self.ecoflow.as_ref().is_some_and(|x| x.is_valid())
            && self.home_assistant.as_ref().is_some_and(|x| x.is_valid())
            && self.smart.is_valid()
    }

    /// config.toml in the working directory, or next to the executable.
    fn path() -> PathBuf {
        let mut path = env::current_dir().unwrap_or_default();
        path.push("config.toml");
        if !path.exists() {
            info!("{} does not exist. Trying relative path", path.display());
            if let Ok(exe) = env::current_exe() {
                path = exe;
                path.pop();
                path.push("config.toml");
            }
        }
        path
    }

    pub fn parse(contents: &str) -> Config {
        match toml::from_str::<Config>(contents) {
            Ok(config) => config,
            Err(e) => {
                warn!("toml config unparsable: {e}");
                Config::default()
            }
        }
    }

    pub fn load() -> Config {
        let path = Self::path();
        info!("loading configuration from {}", path.display());
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("Could not read config.toml: {e}");
                "".into()
            }
        };
        let mut config = Self::parse(&contents);
        config.apply_overrides(|name| env::var(name).ok());
        config
    }

    /// Overwrites settings with environment variables where they are set.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // $POWERSTREAM_IDS, $BATTERY_IDS (comma separated)
        if let Some(ids) = var("POWERSTREAM_IDS") {
            self.devices.powerstreams = id_list(&ids);
        }
        if let Some(ids) = var("BATTERY_IDS") {
            self.devices.batteries = id_list(&ids);
        }
        // $ECOFLOW_BROKER_HOST
        if let Some(host) = var("ECOFLOW_BROKER_HOST") {
            self.ecoflow.get_or_insert_with(MqttConfig::default).host = host;
        }
        // $MQTT_BROKER_HOST
        if let Some(host) = var("MQTT_BROKER_HOST") {
            self.home_assistant.get_or_insert_with(MqttConfig::default).host = host;
        }
        // $MQTT_USERNAME (optional)
        if let Some(username) = var("MQTT_USERNAME") {
            self.home_assistant
                .get_or_insert_with(MqttConfig::default)
                .username = Some(username);
        }
        // $MQTT_PASSWORD (optional)
        if let Some(password) = var("MQTT_PASSWORD") {
            self.home_assistant
                .get_or_insert_with(MqttConfig::default)
                .password = Some(password);
        }
        // $MQTT_PORT (optional)
        if let Some(port) = var("MQTT_PORT") {
            self.home_assistant
                .get_or_insert_with(MqttConfig::default)
                .port = Some(port.parse().unwrap_or(1883));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
        [devices]
        powerstreams = ["HW51A"]
        batteries = ["R601"]

        [ecoflow]
        host = "192.168.0.111"
        tls = true
        tls_insecure = true

        [home_assistant]
        host = "192.168.0.113"
        username = "ha"

        [relay]
        discovery = true

        [smart]
        enabled = true
        meter_topic = "meter/power"
        enabled_topic = "smart/enabled"
        soc_topic = "battery/soc"
        charger_topic = "charger/set"
        max_power = 600
    "#;

    #[test]
    fn parses_example() {
        let config = Config::parse(EXAMPLE);
        assert!(config.is_valid());
        assert_eq!(config.devices.powerstreams, vec!["HW51A"]);
        assert_eq!(config.devices.powerstream_namespace, "/sys/75");
        assert_eq!(config.devices.heartbeat_interval_secs, 5);
        assert!(config.ecoflow.as_ref().unwrap().use_tls());
        assert_eq!(config.relay.namespace, "ecoflow");
        assert!(config.relay.discovery);
        assert_eq!(config.smart.max_power(), 600);
        assert_eq!(config.smart.low_soc_cutoff, 13);
        assert_eq!(config.smart.charger_interval_secs, 15);
    }

    #[test]
    fn smart_mode_needs_its_topics() {
        let mut config = Config::parse(EXAMPLE);
        config.smart.charger_topic = None;
        assert!(!config.is_valid());
        config.smart.enabled = false;
        assert!(config.is_valid());
    }

    #[test]
    fn unparsable_config_falls_back_to_default() {
        let config = Config::parse("devices = 12");
        assert!(config.devices.powerstreams.is_empty());
        assert!(!config.is_valid());
    }

    #[test]
    fn environment_overrides() {
        let mut config = Config::parse("");
        config.apply_overrides(|name| match name {
            "POWERSTREAM_IDS" => Some("HW51A, HW51B".to_string()),
            "ECOFLOW_BROKER_HOST" => Some("10.0.0.2".to_string()),
            "MQTT_BROKER_HOST" => Some("10.0.0.3".to_string()),
            "MQTT_PORT" => Some("not a port".to_string()),
            _ => None,
        });
        assert_eq!(config.devices.powerstreams, vec!["HW51A", "HW51B"]);
        assert_eq!(config.ecoflow.as_ref().unwrap().host, "10.0.0.2");
        let home_assistant = config.home_assistant.as_ref().unwrap();
        assert_eq!(home_assistant.host, "10.0.0.3");
        assert_eq!(home_assistant.port, Some(1883));
        assert!(config.is_valid());
    }
}
