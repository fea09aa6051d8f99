/// Bluetooth Low Energy discovery of nearby BluVib sensors
use futures_util::StreamExt;
use log::{debug, error, warn};
use tokio::time::{sleep, Duration};

use crate::error::TransportError;
use crate::models::DiscoveredDevice;

/// Run a bounded LE discovery on `adapter` and list every device it knows about
///
/// Discovery runs in the background for `timeout`, after which the adapter's
/// device table is read back. Devices whose properties cannot be queried are
/// still reported, just without name or RSSI.
///
/// # Arguments
/// * `adapter` - Powered BlueZ adapter
/// * `timeout` - How long to actively scan
///
/// # Returns
/// Result containing every discovered device, or error if the scan fails
pub async fn discover_devices(
    adapter: &bluer::Adapter,
    timeout: Duration,
) -> Result<Vec<DiscoveredDevice>, TransportError> {
    // Configure discovery filter for Low Energy devices only
    let filter = bluer::DiscoveryFilter {
        transport: bluer::DiscoveryTransport::Le,
        duplicate_data: false,
        ..Default::default()
    };

    // Apply the discovery filter (warn if it fails, but continue)
    if let Err(e) = adapter.set_discovery_filter(filter).await {
        warn!("Failed to set discovery filter: {}", e);
    }

    // Start device discovery in background
    let discovery_handle = match adapter.discover_devices().await {
        Ok(discovery_stream) => tokio::spawn(async move {
            let mut stream = discovery_stream;
            while let Some(event) = stream.next().await {
                debug!("Discovery event: {:?}", event);
            }
        }),
        Err(e) => {
            error!("Failed to start device discovery: {}", e);
            return Err(TransportError::Discovery(e.to_string()));
        }
    };

    sleep(timeout).await;
    discovery_handle.abort();

    let addresses = adapter
        .device_addresses()
        .await
        .map_err(|e| TransportError::Discovery(e.to_string()))?;

    let mut found = Vec::with_capacity(addresses.len());
    for address in addresses {
        let device = match adapter.device(address) {
            Ok(device) => device,
            Err(_) => continue,
        };

        let name = device.name().await.unwrap_or_else(|e| {
            debug!("Failed to get name for {}: {}", address, e);
            None
        });
        let rssi = device.rssi().await.unwrap_or(None);

        found.push(DiscoveredDevice {
            address,
            name,
            rssi,
        });
    }

    Ok(found)
}

/// Whether an advertised name marks a device as a configuration candidate.
pub fn matches_name_prefix(name: Option<&str>, prefix: &str) -> bool {
    name.is_some_and(|name| name.starts_with(prefix))
}

/// Keep candidates matching `prefix`, strongest signal first.
pub fn candidates(mut devices: Vec<DiscoveredDevice>, prefix: &str) -> Vec<DiscoveredDevice> {
    devices.retain(|d| matches_name_prefix(d.name.as_deref(), prefix));
    devices.sort_by(|a, b| b.rssi.unwrap_or(i16::MIN).cmp(&a.rssi.unwrap_or(i16::MIN)));
    devices
}
