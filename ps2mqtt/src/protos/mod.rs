//! Protobuf messages of the PowerStream local MQTT protocol.
#![allow(clippy::all)]

include!(concat!(env!("OUT_DIR"), "/ecoflow/mod.rs"));
