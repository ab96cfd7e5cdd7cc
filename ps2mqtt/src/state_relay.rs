use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};

use crate::config::{DevicesConfig, RelayConfig, SmartConfig};
use crate::home_assistant;
use crate::mqtt_wrapper::{ConnectionState, MqttEvent, MqttWrapper, QoS};
use crate::signals::{self, SignalStore};
use crate::sinks::{ChargerSwitch, CommandSink, TelemetrySink};

/// Setpoints at or above this are not accepted from the automation broker.
pub const MAX_SETPOINT_WATTS: i32 = 800;

/// Home automation side of the bridge.
pub struct StateRelay<MQTT: MqttWrapper> {
    client: Mutex<MQTT>,
    state: Mutex<ConnectionState>,
    signals: Arc<SignalStore>,
    relay: RelayConfig,
    smart: SmartConfig,
    powerstreams: Vec<String>,
    batteries: Vec<String>,
}

impl<MQTT: MqttWrapper> StateRelay<MQTT> {
    pub fn new(
        client: MQTT,
        signals: Arc<SignalStore>,
        devices: &DevicesConfig,
        relay: &RelayConfig,
        smart: &SmartConfig,
    ) -> Self {
        Self {
            client: Mutex::new(client),
            state: Mutex::new(ConnectionState::Connecting),
            signals,
            relay: relay.clone(),
            smart: smart.clone(),
            powerstreams: devices.powerstreams.clone(),
            batteries: devices.batteries.clone(),
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
            info!("home automation broker is {new_state:?}");
        }
    }

    /// Consumes broker events until the transport goes away.
    pub fn run(&self, events: Receiver<MqttEvent>, commands: &dyn CommandSink) {
        for event in events {
            self.handle_event(event, commands);
        }
        self.set_state(ConnectionState::Disconnected);
        info!("home automation broker event stream closed");
    }

    pub fn handle_event(&self, event: MqttEvent, commands: &dyn CommandSink) {
        match event {
            MqttEvent::Connected => {
                self.set_state(ConnectionState::Connected);
                self.on_connected();
            }
            MqttEvent::Disconnected(reason) => {
                if self.connection_state() == ConnectionState::Connected {
                    warn!("disconnected from home automation broker: {reason}");
                }
                self.set_state(ConnectionState::Disconnected);
            }
            MqttEvent::Message { topic, payload } => self.on_message(&topic, &payload, commands),
        }
    }

    fn signal_topics(&self) -> [Option<&String>; 3] {
        [
            self.smart.meter_topic.as_ref(),
            self.smart.enabled_topic.as_ref(),
            self.smart.soc_topic.as_ref(),
        ]
    }

    pub fn on_connected(&self) {
        {
            let mut client = self.client();
            let setpower_topics = self
                .powerstreams
                .iter()
                .map(|device| self.relay.setpower_topic(device));
            for topic in setpower_topics {
                if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce) {
                    error!("subscription to {topic} failed: {e:?}");
                }
            }
            if self.smart.enabled {
                for topic in self.signal_topics().into_iter().flatten() {
                    if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce) {
                        error!("subscription to {topic} failed: {e:?}");
                    }
                }
            }
        }

        if self.relay.discovery {
            if let Err(e) = self.publish_discovery() {
                error!("Error publishing Home Assistant discovery information: {e:?}");
            }
        }
    }

    fn publish_discovery(&self) -> anyhow::Result<()> {
        let prefix = &self.relay.discovery_prefix;
        let mut documents = Vec::new();
        for device in &self.powerstreams {
            documents.extend(home_assistant::powerstream_discovery(
                prefix,
                device,
                &self.relay.state_topic(device),
                &self.relay.setpower_topic(device),
            )?);
        }
        for battery in &self.batteries {
            documents.extend(home_assistant::battery_discovery(
                prefix,
                battery,
                &self.relay.state_topic(battery),
            )?);
        }

        let mut client = self.client();
        for (topic, payload) in documents {
            debug!("Publishing to {topic} with payload {payload}");
            client.publish(topic, QoS::AtLeastOnce, true, serde_json::to_vec(&payload)?)?;
        }
        Ok(())
    }

    pub fn on_message(&self, topic: &str, payload: &[u8], commands: &dyn CommandSink) {
        let text = String::from_utf8_lossy(payload);
        let is = |candidate: &Option<String>| candidate.as_deref() == Some(topic);

        if is(&self.smart.meter_topic) {
            let watts = signals::parse_reading(&text);
            if watts.is_none() {
                debug!("grid power unknown, meter reported {text:?}");
            }
            self.signals.set_grid_power(watts);
        } else if is(&self.smart.enabled_topic) {
            self.signals.set_smart_mode(signals::parse_switch(&text));
        } else if is(&self.smart.soc_topic) {
            let soc = signals::parse_state_of_charge(&text);
            if soc.is_none() {
                debug!("state of charge unknown, received {text:?}");
            }
            self.signals.set_state_of_charge(soc);
        } else {
            self.handle_setpower(topic, &text, commands);
        }
    }

    fn handle_setpower(&self, topic: &str, text: &str, commands: &dyn CommandSink) {
        let Ok(watts) = text.trim().parse::<i32>() else {
            warn!("ignoring setpower {text:?} on {topic}");
            return;
        };
        if !(0..MAX_SETPOINT_WATTS).contains(&watts) {
            return;
        }
        let Some(device_id) = self.setpower_device(topic) else {
            return;
        };
        if let Err(e) = commands.publish_power_setting(watts, device_id) {
            error!("failed to forward setpoint for {device_id}: {e:?}");
        }
    }

    /// Device addressed by a setpower topic; falls back to the first device.
    fn setpower_device(&self, topic: &str) -> Option<&str> {
        self.powerstreams
            .iter()
            .find(|device| self.relay.setpower_topic(device) == topic)
            .or_else(|| self.powerstreams.first())
            .map(String::as_str)
    }

    pub fn is_reachable(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn publish_telemetry(&self, device_id: &str, payload: &serde_json::Value) -> anyhow::Result<()> {
        let topic = self.relay.state_topic(device_id);
        debug!("Publishing to {topic} with payload {payload}");
        let payload = serde_json::to_vec(payload)?;
        self.client()
            .publish(topic, QoS::AtLeastOnce, true, payload)
    }

    pub fn set_charger(&self, enabled: bool) -> anyhow::Result<()> {
        self.signals.set_charger(enabled);
        let Some(topic) = self.smart.charger_topic.as_deref() else {
            anyhow::bail!("no charger topic configured");
        };
        info!("switching charger {}", if enabled { "on" } else { "off" });
        let payload = if enabled { "on" } else { "off" };
        self.client()
            .publish(topic, QoS::AtLeastOnce, true, payload)
    }
}

impl<MQTT: MqttWrapper + Send> TelemetrySink for StateRelay<MQTT> {
    fn is_reachable(&self) -> bool {
        StateRelay::is_reachable(self)
    }

    fn publish_telemetry(&self, device_id: &str, payload: &serde_json::Value) -> anyhow::Result<()> {
        StateRelay::publish_telemetry(self, device_id, payload)
    }
}

impl<MQTT: MqttWrapper + Send> ChargerSwitch for StateRelay<MQTT> {
    fn set_charger(&self, enabled: bool) -> anyhow::Result<()> {
        StateRelay::set_charger(self, enabled)
    }
}
