//! Zero-export control loop.
//!
//! Two independent ticks drive the household's grid power towards zero: the
//! balance tick moves the inverter setpoint, the charger tick switches the
//! battery charger relay when there is enough surplus to charge from. All
//! thresholds are strict comparisons; the bands between them keep the relay
//! and the inverter from chattering.

use std::sync::Arc;

use log::{debug, info};

use crate::config::SmartConfig;
use crate::device_state::{DeviceRecord, DeviceStore};
use crate::signals::{ExternalSignals, SignalStore};
use crate::sinks::{ChargerSwitch, CommandSink};

/// Minimum setpoint change worth sending, in watts.
pub const DEAD_BAND_WATTS: i32 = 10;

/// Setpoint the balance tick wants to send, if any.
pub fn next_setpoint(
    config: &SmartConfig,
    device: &DeviceRecord,
    signals: &ExternalSignals,
) -> Option<i32> {
    let (Some(grid), Some(true), Some(soc)) = (
        signals.grid_power_watts,
        signals.smart_mode_enabled,
        signals.state_of_charge,
    ) else {
        return None;
    };
    let current = device.current_power_watts;

    if soc < config.low_soc_cutoff {
        // battery too low: stop discharging and do nothing else
        return (current > 0).then_some(0);
    }

    if signals.charger_enabled == Some(true) {
        return None;
    }

    let target = if grid > 0 {
        config.max_power().min(grid + current)
    } else if grid < 0 && current > 0 {
        (current + grid).max(0)
    } else {
        return None;
    };

    ((current - target).abs() > DEAD_BAND_WATTS).then_some(target)
}

/// `Some(true)` to switch the charger on, `Some(false)` to switch it off.
pub fn charger_command(config: &SmartConfig, signals: &ExternalSignals) -> Option<bool> {
    let (Some(grid), Some(true), Some(soc)) = (
        signals.grid_power_watts,
        signals.smart_mode_enabled,
        signals.state_of_charge,
    ) else {
        return None;
    };
    // unknown counts as on, so a stale relay still gets switched off
    let charger_on = signals.charger_enabled.unwrap_or(true);

    if soc < config.charge_below_soc
        && grid < config.charge_export_below
        && signals.charger_enabled != Some(true)
    {
        Some(true)
    } else if soc > config.charger_full_soc_above
        || (grid > config.charger_off_import_above && charger_on)
    {
        Some(false)
    } else {
        None
    }
}

pub struct BalanceController {
    config: SmartConfig,
    devices: Arc<DeviceStore>,
    signals: Arc<SignalStore>,
    commands: Arc<dyn CommandSink>,
    charger: Arc<dyn ChargerSwitch>,
}

impl BalanceController {
    pub fn new(
        config: &SmartConfig,
        devices: Arc<DeviceStore>,
        signals: Arc<SignalStore>,
        commands: Arc<dyn CommandSink>,
        charger: Arc<dyn ChargerSwitch>,
    ) -> Self {
        Self {
            config: config.clone(),
            devices,
            signals,
            commands,
            charger,
        }
    }

    pub fn balance_tick(&self) -> anyhow::Result<()> {
        let Some(device) = self.devices.primary() else {
            return Ok(());
        };
        let signals = self.signals.snapshot();

        match next_setpoint(&self.config, &device, &signals) {
            Some(watts) => {
                debug!(
                    "grid {:?} W, output {} W -> {watts} W",
                    signals.grid_power_watts, device.current_power_watts
                );
                self.commands.publish_power_setting(watts, &device.device_id)
            }
            None => Ok(()),
        }
    }

    pub fn charger_tick(&self) -> anyhow::Result<()> {
        let signals = self.signals.snapshot();

        match charger_command(&self.config, &signals) {
            Some(true) => {
                info!(
                    "surplus of {:?} W at {:?}% charge, charging",
                    signals.grid_power_watts.map(i32::abs),
                    signals.state_of_charge
                );
                self.charger.set_charger(true)?;
                // never charge and discharge at the same time
                match self.devices.primary() {
                    Some(device) => self.commands.publish_power_setting(0, &device.device_id),
                    None => Ok(()),
                }
            }
            Some(false) => self.charger.set_charger(false),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(current_power_watts: i32) -> DeviceRecord {
        DeviceRecord {
            device_id: "HW51A".to_string(),
            current_power_watts,
            avg_voltage_volts: 30.0,
            upstream_topic: String::new(),
            command_topic: String::new(),
        }
    }

    fn signals(grid: i32, soc: i32, charger: Option<bool>) -> ExternalSignals {
        ExternalSignals {
            grid_power_watts: Some(grid),
            smart_mode_enabled: Some(true),
            state_of_charge: Some(soc),
            charger_enabled: charger,
        }
    }

    #[test]
    fn small_import_is_within_dead_band() {
        let config = SmartConfig::default();
        assert_eq!(next_setpoint(&config, &device(100), &signals(5, 50, None)), None);
        assert_eq!(next_setpoint(&config, &device(100), &signals(10, 50, None)), None);
        assert_eq!(next_setpoint(&config, &device(100), &signals(11, 50, None)), Some(111));
    }

    #[test]
    fn import_raises_output() {
        let config = SmartConfig::default();
        assert_eq!(next_setpoint(&config, &device(100), &signals(120, 50, None)), Some(220));
    }

    #[test]
    fn import_is_capped_at_max_power() {
        let config = SmartConfig::default();
        assert_eq!(next_setpoint(&config, &device(600), &signals(300, 50, None)), Some(666));

        let config = SmartConfig {
            max_power: Some(400),
            ..SmartConfig::default()
        };
        assert_eq!(next_setpoint(&config, &device(300), &signals(300, 50, None)), Some(400));
        // already at the cap
        assert_eq!(next_setpoint(&config, &device(400), &signals(50, 50, None)), None);
    }

    #[test]
    fn export_lowers_output() {
        let config = SmartConfig::default();
        assert_eq!(next_setpoint(&config, &device(300), &signals(-120, 50, None)), Some(180));
        assert_eq!(next_setpoint(&config, &device(100), &signals(-250, 50, None)), Some(0));
        assert_eq!(next_setpoint(&config, &device(300), &signals(-8, 50, None)), None);
        // nothing to lower
        assert_eq!(next_setpoint(&config, &device(0), &signals(-250, 50, None)), None);
    }

    #[test]
    fn zero_grid_power_keeps_output() {
        let config = SmartConfig::default();
        assert_eq!(next_setpoint(&config, &device(300), &signals(0, 50, None)), None);
    }

    #[test]
    fn low_battery_switches_output_off() {
        let config = SmartConfig::default();
        for grid in [-500, 0, 500] {
            assert_eq!(next_setpoint(&config, &device(50), &signals(grid, 10, None)), Some(0));
        }
        assert_eq!(next_setpoint(&config, &device(0), &signals(500, 10, None)), None);
        // the cutoff is strict
        assert_eq!(next_setpoint(&config, &device(100), &signals(120, 13, None)), Some(220));
    }

    #[test]
    fn charging_blocks_balancing() {
        let config = SmartConfig::default();
        assert_eq!(
            next_setpoint(&config, &device(100), &signals(300, 50, Some(true))),
            None
        );
        assert_eq!(
            next_setpoint(&config, &device(100), &signals(300, 50, Some(false))),
            Some(400)
        );
    }

    #[test]
    fn unknown_signals_gate_everything() {
        let config = SmartConfig::default();
        let full = signals(300, 50, None);
        for incomplete in [
            ExternalSignals {
                state_of_charge: None,
                ..full
            },
            ExternalSignals {
                grid_power_watts: None,
                ..full
            },
            ExternalSignals {
                smart_mode_enabled: None,
                ..full
            },
            ExternalSignals {
                smart_mode_enabled: Some(false),
                ..full
            },
        ] {
            assert_eq!(next_setpoint(&config, &device(100), &incomplete), None);
            assert_eq!(charger_command(&config, &incomplete), None);
        }
    }

    #[test]
    fn charger_switches_on_with_surplus() {
        let config = SmartConfig::default();
        assert_eq!(charger_command(&config, &signals(-650, 90, Some(false))), Some(true));
        assert_eq!(charger_command(&config, &signals(-650, 90, None)), Some(true));
        assert_eq!(charger_command(&config, &signals(-650, 90, Some(true))), None);
    }

    #[test]
    fn charger_thresholds_are_strict() {
        let config = SmartConfig::default();
        assert_eq!(charger_command(&config, &signals(-650, 96, Some(false))), None);
        assert_eq!(charger_command(&config, &signals(-650, 95, Some(false))), None);
        assert_eq!(charger_command(&config, &signals(-600, 90, Some(false))), None);
        assert_eq!(charger_command(&config, &signals(100, 90, Some(true))), None);
        assert_eq!(charger_command(&config, &signals(50, 99, Some(true))), None);
    }

    #[test]
    fn charger_switches_off() {
        let config = SmartConfig::default();
        assert_eq!(charger_command(&config, &signals(-650, 100, Some(true))), Some(false));
        assert_eq!(charger_command(&config, &signals(101, 60, Some(true))), Some(false));
        assert_eq!(charger_command(&config, &signals(101, 60, None)), Some(false));
        assert_eq!(charger_command(&config, &signals(101, 60, Some(false))), None);
    }
}
