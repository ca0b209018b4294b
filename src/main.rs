use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use tokio::sync::Notify;

use scheiber2mqtt::can::CanBus;
use scheiber2mqtt::config::load_config;
use scheiber2mqtt::device::build_devices;
use scheiber2mqtt::error::BridgeError;
use scheiber2mqtt::mqtt::{build_entities, MqttBridge};
use scheiber2mqtt::state;
use scheiber2mqtt::system::System;

#[derive(Parser, Debug)]
#[command(name = "scheiber2mqtt", about = "Scheiber CAN to MQTT bridge")]
struct Args {
    /// Path to the bridge configuration file.
    #[arg(long, default_value = "/etc/scheiber2mqtt/config.json")]
    config: PathBuf,

    /// Observe the bus without sending any frame.
    #[arg(long)]
    read_only: bool,

    /// Override the state-file location from the configuration.
    #[arg(long)]
    state_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run(Args::parse()).await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), BridgeError> {
    let mut config = load_config(&args.config)?;
    if args.read_only {
        config.can.read_only = true;
    }
    if let Some(path) = args.state_file {
        config.state_file = Some(path);
    }

    let bus = Arc::new(CanBus::open(&config.can.interface, config.can.read_only)?);
    info!(
        "opened {}{}",
        config.can.interface,
        if config.can.read_only { " (read-only)" } else { "" }
    );

    let devices = build_devices(&config, bus.clone())?;
    let system = System::new(devices, config.state_path(), state::SAVE_INTERVAL);
    system.start(bus).await;

    let entities = build_entities(system.devices(), &config.mqtt.discovery_prefix);
    info!("bridging {} entities", entities.len());
    let bridge = MqttBridge::new(&config.mqtt, entities);

    let shutdown = Arc::new(Notify::new());
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown requested");
        signal_shutdown.notify_waiters();
    });

    // Fatal MQTT auth errors propagate; a signal resolves the run cleanly.
    let result = bridge.run(shutdown).await;
    system.stop().await;
    result
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
