use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::DevicesConfig;
use crate::frame_codec::InverterStatus;

#[derive(Clone, Debug, PartialEq)]
pub struct DeviceRecord {
    pub device_id: String,
    pub current_power_watts: i32,
    pub avg_voltage_volts: f64,
    pub upstream_topic: String,
    pub command_topic: String,
}

impl DeviceRecord {
    fn apply(&mut self, status: &InverterStatus) {
        self.current_power_watts = status.output_watts();
        self.avg_voltage_volts = status.avg_pv_voltage();
    }
}

/// Records of all configured power-stream devices.
///
/// Created once from configuration; records are only ever updated, never
/// removed. Readers always get a copy.
#[derive(Debug)]
pub struct DeviceStore {
    records: Mutex<Vec<DeviceRecord>>,
}

impl DeviceStore {
    pub fn new(config: &DevicesConfig) -> Self {
        let records = config
            .powerstreams
            .iter()
            .map(|device_id| DeviceRecord {
                device_id: device_id.clone(),
                current_power_watts: 0,
                avg_voltage_volts: 0.0,
                upstream_topic: config.upstream_topic(device_id),
                command_topic: config.command_topic(device_id),
            })
            .collect();
        Self {
            records: Mutex::new(records),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<DeviceRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceRecord> {
        self.lock()
            .iter()
            .find(|record| record.device_id == device_id)
            .cloned()
    }

    /// The first configured device, the one the balance controller drives.
    pub fn primary(&self) -> Option<DeviceRecord> {
        self.lock().first().cloned()
    }

    pub fn all(&self) -> Vec<DeviceRecord> {
        self.lock().clone()
    }

    pub fn device_for_upstream(&self, topic: &str) -> Option<String> {
        self.lock()
            .iter()
            .find(|record| record.upstream_topic == topic)
            .map(|record| record.device_id.clone())
    }

    /// Returns the updated record, or `None` for an unknown device.
    pub fn apply_status(&self, device_id: &str, status: &InverterStatus) -> Option<DeviceRecord> {
        let mut records = self.lock();
        let record = records
            .iter_mut()
            .find(|record| record.device_id == device_id)?;
        record.apply(status);
        Some(record.clone())
    }
}
