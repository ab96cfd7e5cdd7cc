use std::sync::mpsc::Sender;

use crate::mqtt_config::MqttConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// Inbound side of a broker connection, delivered in receipt order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MqttEvent {
    Connected,
    Disconnected(String),
    Message { topic: String, payload: Vec<u8> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

pub trait MqttWrapper {
    // This trait provides an interface that the decouples library code from an
    // implementation of the MQTT client. On library calling code, one needs to
    // wrap the MQTT implementation, i.e. the client, in a new type that in
    // turn implements this trait.

    fn subscribe(&mut self, topic: &str, qos: QoS) -> anyhow::Result<()>;

    /// Queues a message without blocking on the network.
    fn publish<S, V>(&mut self, topic: S, qos: QoS, retain: bool, payload: V) -> anyhow::Result<()>
    where
        S: Clone + Into<String>,
        V: Clone + Into<Vec<u8>>;

    /// Starts connecting. Connection changes and incoming messages are sent
    /// to `events`.
    fn new(config: &MqttConfig, suffix: &str, events: Sender<MqttEvent>) -> Self;
}
