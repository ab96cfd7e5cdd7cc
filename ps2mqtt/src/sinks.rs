//! Narrow interfaces the stateful components use to reach each other.
//!
//! `DeviceBridge` implements [`CommandSink`], `StateRelay` implements
//! [`TelemetrySink`] and [`ChargerSwitch`]. Both are built first and handed to
//! each other's consumer loop and to the `BalanceController` afterwards, so no
//! component holds a reference back to its creator.

pub trait CommandSink: Send + Sync {
    fn publish_power_setting(&self, watts: i32, device_id: &str) -> anyhow::Result<()>;
}

pub trait TelemetrySink: Send + Sync {
    fn is_reachable(&self) -> bool;

    fn publish_telemetry(&self, device_id: &str, payload: &serde_json::Value) -> anyhow::Result<()>;
}

pub trait ChargerSwitch: Send + Sync {
    fn set_charger(&self, enabled: bool) -> anyhow::Result<()>;
}
