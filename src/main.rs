use bluer::Address;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};

use bluvib_config::utils::{format_battery, format_device_time, format_temperature};
use bluvib_config::{
    BluerBackend, ConnectionSupervisor, DeviceController, Error, ParameterSession, SessionConfig,
};

const SAMPLE_LOG_INTERVAL_SECS: u64 = 5;

async fn run_sensor(
    supervisor: Arc<ConnectionSupervisor<BluerBackend>>,
    address: Address,
    name: String,
) -> Result<(), Error> {
    let config = supervisor.config().clone();
    let session = ParameterSession::open(supervisor, address).await?;
    let (controller, _worker) = DeviceController::spawn(session, &Handle::current());

    // Print parameter table
    info!("Parameters of {} ({}):", name, address);
    for row in controller.parameters().await? {
        match row.display {
            Some(display) => info!("  {}: {} ({:?})", row.display_name, display, row.status),
            None => info!("  {}: - ({:?})", row.display_name, row.status),
        }
    }

    let readings = controller.read_readings().await?;
    if let Some(celsius) = readings.temperature_c {
        info!("  Temperature: {}", format_temperature(celsius));
    }
    if let Some(volts) = readings.battery_v {
        info!("  Battery: {}", format_battery(volts));
    }
    if let Some(clock) = readings.device_time {
        info!("  Device time: {}", format_device_time(&clock));
    }

    // Apply configured edits; each one succeeds or fails on its own
    let mut applied = 0;
    for (key, label) in &config.apply {
        match controller.write_parameter(key, label).await {
            Ok(raw) => {
                applied += 1;
                info!("{}: set {} to {} (raw {})", name, key, label, raw);
            }
            Err(e) => error!("{}: failed to set {}: {} [{}]", name, key, e, e.status_text()),
        }
    }

    if config.commit_after_apply && applied > 0 {
        match controller.commit().await {
            Ok(_) => info!("{}: commit successful", name),
            Err(e) => error!("{}: commit failed: {} [{}]", name, e, e.status_text()),
        }
    }

    let samples = controller.start_stream().await?;
    loop {
        sleep(Duration::from_secs(SAMPLE_LOG_INTERVAL_SECS)).await;
        match samples.latest() {
            Some(sample) => info!(
                "{}: t={:.2}s mean={:.4} velocity={:.4} ({} samples buffered)",
                name,
                sample.timestamp,
                sample.raw_mean,
                sample.velocity,
                samples.len()
            ),
            None => warn!("{}: no acceleration data received yet", name),
        }
    }
}

async fn main_loop(
    supervisor: Arc<ConnectionSupervisor<BluerBackend>>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting BluVib configuration session");

    let candidates = supervisor.discover().await?;
    for device in &candidates {
        info!(
            "Found {} ({}), RSSI {}",
            device.name.as_deref().unwrap_or("Unknown"),
            device.address,
            device
                .rssi
                .map(|rssi| format!("{} dBm", rssi))
                .unwrap_or_else(|| "n/a".to_string())
        );
    }

    let sensors = &supervisor.config().sensors;
    let targets: Vec<(Address, String)> = if sensors.is_empty() {
        candidates
            .into_iter()
            .map(|d| {
                let name = d.name.unwrap_or_else(|| d.address.to_string());
                (d.address, name)
            })
            .collect()
    } else {
        sensors
            .iter()
            .map(|(address, name)| (*address, name.clone()))
            .collect()
    };

    // Warning if there is nothing to talk to
    if targets.is_empty() {
        warn!("No BluVib sensors found!");
        return Ok(());
    }

    let mut tasks = JoinSet::new();
    for (address, name) in targets {
        let supervisor = supervisor.clone();
        tasks.spawn(async move {
            if let Err(e) = run_sensor(supervisor, address, name.clone()).await {
                error!("{} ({}): {} [{}]", name, address, e, e.status_text());
            }
        });
    }
    while tasks.join_next().await.is_some() {}

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match SessionConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    let backend = match BluerBackend::new().await {
        Ok(backend) => backend,
        Err(e) => {
            error!("Failed to initialise Bluetooth: {}", e);
            return Err(e.into());
        }
    };
    let supervisor = Arc::new(ConnectionSupervisor::new(backend, config));

    // Handle Ctrl+C gracefully
    let (tx, mut rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        let _ = tx.send(());
    });

    // Run main loop or wait for shutdown signal
    tokio::select! {
        result = main_loop(supervisor.clone()) => {
            match result {
                Ok(_) => info!("Program completed successfully"),
                Err(e) => error!("Fatal error: {}", e),
            }
        }
        _ = &mut rx => {
            info!("Program terminated by user. Exiting gracefully.");
        }
    }

    supervisor.disconnect_all().await;
    Ok(())
}
