use std::path::PathBuf;

use anyhow::Context as _;
use btleplug::api::Manager as _;
use btleplug::platform::Manager;
use clap::Parser;
use log::{error, info};
use tokio::sync::{broadcast, mpsc};

mod btle;
mod classifier;
mod config;
mod manager;
mod messages;
mod mqtt;
mod provider;

use messages::{Command, ProximityAnnouncement};

#[derive(Parser, Debug)]
#[command(version, about = "Range iBeacons and advertise as one")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Advertise the configured identity regardless of the config file
    #[arg(long)]
    advertise: bool,

    /// Do not start scanning on launch
    #[arg(long)]
    no_scan: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        pretty_env_logger::formatted_builder()
            .filter_level(log::LevelFilter::Info)
            .init();
    } else {
        pretty_env_logger::init();
    }

    let args = Args::parse();

    let config_contents = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading {}", args.config.display()))?;
    let config: config::AppConfig = toml::de::from_str(&config_contents)
        .with_context(|| format!("parsing {}", args.config.display()))?;

    let target = config.target();
    let scan_config = config.scan.clone().unwrap_or_default();
    let advertise_config = config.advertise.clone().unwrap_or_default();
    info!("Target beacon: {}", target);

    let (command_tx, command_rx) = broadcast::channel(64);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (announce_tx, _) = broadcast::channel::<ProximityAnnouncement>(32);

    let mqtt_client = match &config.mqtt {
        Some(mqtt_config) => {
            let (mqtt_client, mut eventloop) = mqtt::MqttClient::new(mqtt_config);
            mqtt_client.subscribe().await?;

            let listener = mqtt_client.clone();
            let tx = command_tx.clone();
            tokio::spawn(async move { listener.event_loop(&mut eventloop, tx).await });

            let publisher = mqtt_client.clone();
            let rx = announce_tx.subscribe();
            tokio::spawn(async move { publisher.publish_loop(rx).await });

            Some(mqtt_client)
        }
        None => None,
    };

    let bt_manager = Manager::new().await?;

    // get the first bluetooth adapter
    let adapters = bt_manager.adapters().await?;
    let central = adapters
        .into_iter()
        .next()
        .context("no Bluetooth adapter found")?;

    let provider = btle::BtleProvider::new(
        central,
        event_tx,
        btle::RangingParameters::from(&scan_config),
    )
    .await?;

    let hook_tx = announce_tx.clone();
    let classifier = classifier::ProximityClassifier::new(move |identity, proximity| {
        info!("{}: {}", identity.identifier, proximity);
        // No subscribers just means MQTT is off.
        let _ = hook_tx.send(ProximityAnnouncement {
            identity: identity.clone(),
            proximity,
        });
    });

    let core = manager::Manager::new(provider, classifier, target)
        .with_advertise_target(config.advertised_identity())
        .with_measured_power(advertise_config.measured_power.or(Some(-59)));

    if scan_config.enabled.unwrap_or(true) && !args.no_scan {
        command_tx.send(Command::StartScanning(None))?;
    }
    if args.advertise || advertise_config.enabled.unwrap_or(false) {
        command_tx.send(Command::StartAdvertising(None))?;
    }

    let shutdown_tx = command_tx.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Error waiting for Ctrl-C: {:?}", err);
        }
        let _ = shutdown_tx.send(Command::Shutdown);
    });

    core.run_loop(command_rx, event_rx).await?;
    info!("Exiting manager event loop");

    if let Some(mqtt_client) = mqtt_client {
        mqtt_client.disconnect().await?;
    }

    Ok(())
}
