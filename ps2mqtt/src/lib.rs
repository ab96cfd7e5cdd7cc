// externally visible interfaces
pub mod balance_controller;
pub mod config;
pub mod device_bridge;
pub mod device_state;
pub mod frame_codec;
pub mod home_assistant;
pub mod mqtt_config;
pub mod mqtt_wrapper;
pub mod protos;
pub mod signals;
pub mod sinks;
pub mod state_relay;
