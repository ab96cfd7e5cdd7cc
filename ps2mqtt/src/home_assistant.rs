use serde::Serialize;

/// `DeviceConfig` is used to define the configuration for a Home Assistant device
/// in the MQTT discovery protocol and is used to group entities together.
#[derive(Serialize, Clone, Debug)]
pub struct DeviceConfig {
    name: String,
    model: String,
    identifiers: Vec<String>,
    manufacturer: String,
    serial_number: String,
    sw_version: String, // Software version of the application that supplies the discovered MQTT item.
}

impl DeviceConfig {
    pub fn new(name: String, model: &str, serial_number: &str) -> Self {
        Self {
            name,
            model: model.to_string(),
            identifiers: Vec::from([serial_number.to_string()]),
            manufacturer: "EcoFlow".to_string(),
            serial_number: serial_number.to_string(),
            sw_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn identifier(&self) -> &str {
        &self.serial_number
    }
}

/// `SensorConfig` is used to define the configuration for a Home Assistant sensor entity
/// in the MQTT discovery protocol.
///
/// More information about the MQTT discovery protocol can be found here:
/// https://www.home-assistant.io/docs/mqtt/discovery/
#[derive(Serialize, Debug)]
pub struct SensorConfig {
    unique_id: String,
    name: String,
    state_topic: String,
    unit_of_measurement: String,
    value_template: String,
    device: DeviceConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<String>,
}

impl SensorConfig {
    pub fn new_sensor(
        state_topic: &str,
        device_config: &DeviceConfig,
        key: &str,
        name: &str,
        device_class: &str,
        unit_of_measurement: &str,
    ) -> Self {
        let value_template = format!("{{{{ value_json.{key} }}}}");
        let unique_id = format!("{}_{key}", device_config.identifier());
        let device_class = (!device_class.is_empty()).then(|| device_class.to_string());
        Self {
            unique_id,
            name: name.to_string(),
            state_topic: state_topic.to_string(),
            unit_of_measurement: unit_of_measurement.to_string(),
            device_class,
            value_template,
            device: device_config.clone(),
        }
    }

    pub fn power(state_topic: &str, device_config: &DeviceConfig, name: &str, key: &str) -> Self {
        Self::new_sensor(state_topic, device_config, key, name, "power", "W")
    }

    pub fn voltage(state_topic: &str, device_config: &DeviceConfig, name: &str, key: &str) -> Self {
        Self::new_sensor(state_topic, device_config, key, name, "voltage", "V")
    }

    pub fn current(state_topic: &str, device_config: &DeviceConfig, name: &str, key: &str) -> Self {
        Self::new_sensor(state_topic, device_config, key, name, "current", "A")
    }

    pub fn temperature(
        state_topic: &str,
        device_config: &DeviceConfig,
        name: &str,
        key: &str,
    ) -> Self {
        Self::new_sensor(state_topic, device_config, key, name, "temperature", "°C")
    }

    pub fn battery(state_topic: &str, device_config: &DeviceConfig, name: &str, key: &str) -> Self {
        Self::new_sensor(state_topic, device_config, key, name, "battery", "%")
    }
}

/// Slider entity that writes the output setpoint.
#[derive(Serialize, Debug)]
pub struct NumberConfig {
    unique_id: String,
    name: String,
    command_topic: String,
    state_topic: String,
    value_template: String,
    device_class: String,
    unit_of_measurement: String,
    min: i32,
    max: i32,
    mode: String,
    device: DeviceConfig,
}

impl NumberConfig {
    pub fn setpoint(command_topic: &str, state_topic: &str, device_config: &DeviceConfig) -> Self {
        Self {
            unique_id: format!("{}_power_set", device_config.identifier()),
            name: "Set Output Watts".to_string(),
            command_topic: command_topic.to_string(),
            state_topic: state_topic.to_string(),
            value_template: "{{ value_json.permanentWatts }}".to_string(),
            device_class: "power".to_string(),
            unit_of_measurement: "W".to_string(),
            min: 0,
            max: 800,
            mode: "slider".to_string(),
            device: device_config.clone(),
        }
    }
}

/// Discovery documents as `(topic, payload)` pairs.
pub type Discovery = Vec<(String, serde_json::Value)>;

fn config_topic(prefix: &str, component: &str, unique_id: &str) -> String {
    format!("{prefix}/{component}/{unique_id}/config")
}

fn sensor_entries(prefix: &str, sensors: Vec<SensorConfig>) -> serde_json::Result<Discovery> {
    sensors
        .into_iter()
        .map(|sensor| {
            let topic = config_topic(prefix, "sensor", &sensor.unique_id);
            serde_json::to_value(&sensor).map(|payload| (topic, payload))
        })
        .collect()
}

pub fn powerstream_discovery(
    prefix: &str,
    device_id: &str,
    state_topic: &str,
    command_topic: &str,
) -> serde_json::Result<Discovery> {
    let device_config = DeviceConfig::new(format!("PowerStream {device_id}"), "PowerStream", device_id);

    let number = NumberConfig::setpoint(command_topic, state_topic, &device_config);
    let mut discovery = vec![(
        config_topic(prefix, "number", &number.unique_id),
        serde_json::to_value(&number)?,
    )];

    discovery.extend(sensor_entries(
        prefix,
        vec![
            SensorConfig::power(state_topic, &device_config, "Output Watts", "invOutputWatts"),
            SensorConfig::power(state_topic, &device_config, "Permanent Watts", "permanentWatts"),
            SensorConfig::temperature(state_topic, &device_config, "LLC Temperature", "llcTemp"),
            SensorConfig::voltage(state_topic, &device_config, "PV 1 Voltage", "pv1InputVolt"),
            SensorConfig::current(state_topic, &device_config, "PV 1 Current", "pv1InputCur"),
            SensorConfig::voltage(state_topic, &device_config, "PV 2 Voltage", "pv2InputVolt"),
            SensorConfig::current(state_topic, &device_config, "PV 2 Current", "pv2InputCur"),
        ],
    )?);
    Ok(discovery)
}

pub fn battery_discovery(
    prefix: &str,
    battery_id: &str,
    state_topic: &str,
) -> serde_json::Result<Discovery> {
    let device_config = DeviceConfig::new(format!("Battery {battery_id}"), "River 2 Pro", battery_id);
    sensor_entries(
        prefix,
        vec![SensorConfig::battery(
            state_topic,
            &device_config,
            "State of charge",
            "soc",
        )],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn powerstream_entities() {
        let discovery = powerstream_discovery(
            "homeassistant",
            "HW51A",
            "ecoflow/HW51A/state",
            "ecoflow/HW51A/setpower",
        )
        .unwrap();
        assert_eq!(discovery.len(), 8);

        let (topic, number) = &discovery[0];
        assert_eq!(topic, "homeassistant/number/HW51A_power_set/config");
        assert_eq!(number["command_topic"], "ecoflow/HW51A/setpower");
        assert_eq!(number["max"], 800);
        assert_eq!(number["device"]["identifiers"][0], "HW51A");

        let (topic, sensor) = &discovery[1];
        assert_eq!(topic, "homeassistant/sensor/HW51A_invOutputWatts/config");
        assert_eq!(sensor["value_template"], "{{ value_json.invOutputWatts }}");
        assert_eq!(sensor["device_class"], "power");
        assert_eq!(sensor["state_topic"], "ecoflow/HW51A/state");
    }

    #[test]
    fn battery_entity() {
        let discovery = battery_discovery("ha", "R601", "ecoflow/R601/state").unwrap();
        assert_eq!(discovery.len(), 1);
        assert_eq!(discovery[0].0, "ha/sensor/R601_soc/config");
        assert_eq!(discovery[0].1["unit_of_measurement"], "%");
    }
}
