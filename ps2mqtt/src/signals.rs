use std::sync::{Mutex, MutexGuard, PoisonError};

/// Values learned from the home automation broker. `None` means unknown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExternalSignals {
    pub grid_power_watts: Option<i32>,
    pub smart_mode_enabled: Option<bool>,
    pub state_of_charge: Option<i32>,
    pub charger_enabled: Option<bool>,
}

#[derive(Debug, Default)]
pub struct SignalStore {
    signals: Mutex<ExternalSignals>,
}

impl SignalStore {
    fn lock(&self) -> MutexGuard<'_, ExternalSignals> {
        self.signals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> ExternalSignals {
        *self.lock()
    }

    pub fn set_grid_power(&self, watts: Option<i32>) {
        self.lock().grid_power_watts = watts;
    }

    pub fn set_smart_mode(&self, enabled: bool) {
        self.lock().smart_mode_enabled = Some(enabled);
    }

    pub fn set_state_of_charge(&self, percent: Option<i32>) {
        self.lock().state_of_charge = percent;
    }

    pub fn set_charger(&self, enabled: bool) {
        self.lock().charger_enabled = Some(enabled);
    }
}

/// Parses a decimal reading such as `"-550"` or `"231.7"`, truncating towards
/// zero.
pub fn parse_reading(text: &str) -> Option<i32> {
    text.trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .map(|value| value as i32)
}

pub fn parse_state_of_charge(text: &str) -> Option<i32> {
    parse_reading(text).filter(|percent| (0..=100).contains(percent))
}

pub fn parse_switch(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case("ON")
}
