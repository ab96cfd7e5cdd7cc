mod config;
mod logging;
mod rumqttc_wrapper;

use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use config::Config;
use log::{error, info};
use ps2mqtt::balance_controller::BalanceController;
use ps2mqtt::device_bridge::DeviceBridge;
use ps2mqtt::device_state::DeviceStore;
use ps2mqtt::mqtt_wrapper::MqttWrapper;
use ps2mqtt::signals::SignalStore;
use ps2mqtt::state_relay::StateRelay;
use rumqttc_wrapper::RumqttcWrapper;

/// Runs `action` every `period` until the process ends. A failed tick is
/// logged and the schedule carries on.
fn every<F>(name: &'static str, period: Duration, mut action: F) -> thread::JoinHandle<()>
where
    F: FnMut() -> anyhow::Result<()> + Send + 'static,
{
    let period = period.max(Duration::from_secs(1));
    thread::spawn(move || loop {
        thread::sleep(period);
        if let Err(e) = action() {
            error!("{name} failed: {e:?}");
        }
    })
}

fn main() {
    logging::init_logger();
    info!("Running revision: {}", env!("GIT_HASH"));
    if std::env::args().len() > 1 {
        error!("Arguments passed. Tool is configured by config.toml in its path");
    }

    let config = Config::load();
    let (Some(ecoflow), Some(home_assistant), true) = (
        config.ecoflow.as_ref(),
        config.home_assistant.as_ref(),
        config.is_valid(),
    ) else {
        error!("configuration incomplete: powerstreams, [ecoflow] and [home_assistant] are required, [smart] needs all of its topics when enabled");
        std::process::exit(1);
    };

    let devices = Arc::new(DeviceStore::new(&config.devices));
    let signals = Arc::new(SignalStore::default());

    info!("device broker: {}", ecoflow.host);
    let (device_events, device_rx) = mpsc::channel();
    let bridge = Arc::new(DeviceBridge::new(
        RumqttcWrapper::new(ecoflow, "-ec", device_events),
        devices.clone(),
        &config.devices,
    ));

    info!("home automation broker: {}", home_assistant.host);
    let (relay_events, relay_rx) = mpsc::channel();
    let relay = Arc::new(StateRelay::new(
        RumqttcWrapper::new(home_assistant, "-ha", relay_events),
        signals.clone(),
        &config.devices,
        &config.relay,
        &config.smart,
    ));

    let device_loop = {
        let (bridge, relay) = (bridge.clone(), relay.clone());
        thread::spawn(move || bridge.run(device_rx, relay.as_ref()))
    };
    let relay_loop = {
        let (bridge, relay) = (bridge.clone(), relay.clone());
        thread::spawn(move || relay.run(relay_rx, bridge.as_ref()))
    };

    {
        let (bridge, relay) = (bridge.clone(), relay.clone());
        every(
            "heartbeat",
            Duration::from_secs(config.devices.heartbeat_interval_secs),
            move || bridge.send_heartbeats(relay.as_ref()),
        );
    }

    if config.smart.enabled {
        info!(
            "smart mode enabled, max power {} W",
            config.smart.max_power()
        );
        let controller = Arc::new(BalanceController::new(
            &config.smart,
            devices,
            signals,
            bridge,
            relay,
        ));
        let balance = controller.clone();
        every(
            "power balance",
            Duration::from_secs(config.smart.balance_interval_secs),
            move || balance.balance_tick(),
        );
        every(
            "charger control",
            Duration::from_secs(config.smart.charger_interval_secs),
            move || controller.charger_tick(),
        );
    } else {
        info!("smart mode disabled");
    }

    for (name, handle) in [("device", device_loop), ("home automation", relay_loop)] {
        if handle.join().is_err() {
            error!("{name} event loop panicked");
        }
    }
}
