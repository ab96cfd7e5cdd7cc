use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use chrono::Utc;
use log::{debug, error, info, warn};

use crate::config::DevicesConfig;
use crate::device_state::DeviceStore;
use crate::frame_codec;
use crate::mqtt_wrapper::{ConnectionState, MqttEvent, MqttWrapper, QoS};
use crate::sinks::{CommandSink, TelemetrySink};

/// Device side of the bridge: talks to the PowerStream broker.
pub struct DeviceBridge<MQTT: MqttWrapper> {
    client: Mutex<MQTT>,
    state: Mutex<ConnectionState>,
    devices: Arc<DeviceStore>,
    /// `(topic, battery id)` pairs.
    battery_topics: Vec<(String, String)>,
}

impl<MQTT: MqttWrapper> DeviceBridge<MQTT> {
    pub fn new(client: MQTT, devices: Arc<DeviceStore>, config: &DevicesConfig) -> Self {
        if config.powerstreams.is_empty() {
            warn!("no powerstream devices configured");
        }
        let battery_topics = config
            .batteries
            .iter()
            .map(|battery| (config.battery_topic(battery), battery.clone()))
            .collect();
        Self {
            client: Mutex::new(client),
            state: Mutex::new(ConnectionState::Connecting),
            devices,
            battery_topics,
        }
    }

    fn client(&self) -> MutexGuard<'_, MQTT> {
        self.client.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, new_state: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != new_state {
            *state = new_state;
            info!("device broker is {new_state:?}");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Consumes broker events until the transport goes away.
    pub fn run(&self, events: Receiver<MqttEvent>, telemetry: &dyn TelemetrySink) {
        for event in events {
            self.handle_event(event, telemetry);
        }
        self.set_state(ConnectionState::Disconnected);
        info!("device broker event stream closed");
    }

    pub fn handle_event(&self, event: MqttEvent, telemetry: &dyn TelemetrySink) {
        match event {
            MqttEvent::Connected => {
                self.set_state(ConnectionState::Connected);
                self.on_connected();
            }
            MqttEvent::Disconnected(reason) => {
                if self.is_connected() {
                    warn!("disconnected from device broker: {reason}");
                }
                self.set_state(ConnectionState::Disconnected);
            }
            MqttEvent::Message { topic, payload } => self.on_message(&topic, &payload, telemetry),
        }
    }

    pub fn on_connected(&self) {
        let devices = self.devices.all();
        {
            let mut client = self.client();
            let topics = devices
                .iter()
                .map(|device| &device.upstream_topic)
                .chain(self.battery_topics.iter().map(|(topic, _)| topic));
            for topic in topics {
                if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce) {
                    error!("subscription to {topic} failed: {e:?}");
                }
            }
        }

        // start from a known output until the controller or the user says otherwise
        for device in &devices {
            if let Err(e) = self.publish_power_setting(0, &device.device_id) {
                error!("initial power setting for {} failed: {e:?}", device.device_id);
            }
        }
    }

    pub fn on_message(&self, topic: &str, payload: &[u8], telemetry: &dyn TelemetrySink) {
        if let Some((_, battery_id)) = self.battery_topics.iter().find(|(t, _)| t == topic) {
            if let Err(e) = self.handle_battery_message(battery_id, payload, telemetry) {
                error!("battery message on {topic} not processed: {e:?}");
            }
        } else if let Some(device_id) = self.devices.device_for_upstream(topic) {
            self.handle_telemetry(&device_id, payload, telemetry);
        } else {
            debug!("ignoring message on {topic}");
        }
    }

    fn handle_telemetry(&self, device_id: &str, payload: &[u8], telemetry: &dyn TelemetrySink) {
        debug!("received {} bytes from {device_id}", payload.len());
        let status = match frame_codec::decode_telemetry(payload) {
            Ok(Some(status)) => status,
            Ok(None) => return,
            Err(e) => {
                warn!("dropping frame from {device_id}: {e}");
                return;
            }
        };

        if let Some(record) = self.devices.apply_status(device_id, &status) {
            debug!(
                "{device_id}: {} W, {:.1} V",
                record.current_power_watts, record.avg_voltage_volts
            );
        }

        if telemetry.is_reachable() {
            let json = status.to_json_payload(Utc::now().timestamp_millis());
            if let Err(e) = telemetry.publish_telemetry(device_id, &json) {
                error!("failed to forward telemetry of {device_id}: {e:?}");
            }
        }
    }

    fn handle_battery_message(
        &self,
        battery_id: &str,
        payload: &[u8],
        telemetry: &dyn TelemetrySink,
    ) -> anyhow::Result<()> {
        let message: serde_json::Value = serde_json::from_slice(payload)?;
        if message["typeCode"] != "bmsStatus" {
            return Ok(());
        }
        let soc = message["params"]["f32ShowSoc"]
            .as_f64()
            .context("bmsStatus without f32ShowSoc")?;
        let json = serde_json::json!({
            "soc": soc,
            "last_updated": Utc::now().timestamp_millis(),
        });
        telemetry.publish_telemetry(battery_id, &json)
    }

    pub fn publish_power_setting(&self, watts: i32, device_id: &str) -> anyhow::Result<()> {
        let device = self
            .devices
            .get(device_id)
            .with_context(|| format!("unknown device {device_id}"))?;
        info!("setting output of {device_id} to {watts} W");
        let payload = frame_codec::encode_set_power(watts, device_id)?;
        self.client()
            .publish(device.command_topic, QoS::AtMostOnce, false, payload)
    }

    pub fn send_heartbeat(&self, device_id: &str) -> anyhow::Result<()> {
        let device = self
            .devices
            .get(device_id)
            .with_context(|| format!("unknown device {device_id}"))?;
        let payload = frame_codec::encode_heartbeat()?;
        self.client()
            .publish(device.command_topic, QoS::AtMostOnce, false, payload)
    }

    /// Keeps every device reporting at its normal cadence.
    pub fn send_heartbeats(&self, telemetry: &dyn TelemetrySink) -> anyhow::Result<()> {
        if !self.is_connected() || !telemetry.is_reachable() {
            return Ok(());
        }
        for device in self.devices.all() {
            self.send_heartbeat(&device.device_id)?;
        }
        Ok(())
    }
}

impl<MQTT: MqttWrapper + Send> CommandSink for DeviceBridge<MQTT> {
    fn publish_power_setting(&self, watts: i32, device_id: &str) -> anyhow::Result<()> {
        DeviceBridge::publish_power_setting(self, watts, device_id)
    }
}
