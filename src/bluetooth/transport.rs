/// Transport contract used by the session layer and its BlueZ implementation
use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Address, Uuid};
use futures_util::Stream;
use log::{debug, warn};
use std::collections::HashMap;
use std::pin::Pin;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

use crate::bluetooth::scanner;
use crate::error::TransportError;
use crate::models::DiscoveredDevice;

const SERVICE_RESOLVE_POLLS: usize = 50;
const SERVICE_RESOLVE_INTERVAL_MS: u64 = 100;

/// Stream of raw notification payloads for one characteristic.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// A single BLE link to one device.
///
/// `write_characteristic` may never complete on a stale link. Callers are
/// expected to bound it with their own timeout.
#[async_trait]
pub trait Transport: Send + Sync {
    fn address(&self) -> Address;

    async fn connect(&self) -> Result<(), TransportError>;

    /// Safe to call on an already disconnected link.
    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn is_connected(&self) -> bool;

    async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>, TransportError>;

    async fn write_characteristic(&self, uuid: Uuid, data: &[u8]) -> Result<(), TransportError>;

    /// Dropping the returned stream ends the subscription.
    async fn subscribe(&self, uuid: Uuid) -> Result<NotificationStream, TransportError>;
}

/// Discovery plus a factory for fresh transports.
#[async_trait]
pub trait BleBackend: Send + Sync + 'static {
    type Transport: Transport + 'static;

    /// Scan for `timeout` and report every advertising device.
    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>, TransportError>;

    /// Build an unconnected transport for `address`.
    fn create_transport(&self, address: Address) -> Result<Self::Transport, TransportError>;
}

/// Backend over the default BlueZ adapter.
pub struct BluerBackend {
    _session: bluer::Session,
    adapter: bluer::Adapter,
}

impl BluerBackend {
    pub async fn new() -> Result<Self, TransportError> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;

        // Ensure Bluetooth adapter is powered on
        adapter.set_powered(true).await?;
        debug!("Using Bluetooth adapter {}", adapter.name());

        Ok(BluerBackend {
            _session: session,
            adapter,
        })
    }
}

#[async_trait]
impl BleBackend for BluerBackend {
    type Transport = BluerTransport;

    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>, TransportError> {
        scanner::discover_devices(&self.adapter, timeout).await
    }

    fn create_transport(&self, address: Address) -> Result<BluerTransport, TransportError> {
        let device = self.adapter.device(address)?;
        Ok(BluerTransport::new(device))
    }
}

/// GATT client for one BlueZ device.
pub struct BluerTransport {
    device: bluer::Device,
    characteristics: Mutex<HashMap<Uuid, Characteristic>>,
}

impl BluerTransport {
    pub fn new(device: bluer::Device) -> Self {
        BluerTransport {
            device,
            characteristics: Mutex::new(HashMap::new()),
        }
    }

    async fn wait_for_services(&self) -> Result<(), TransportError> {
        for _ in 0..SERVICE_RESOLVE_POLLS {
            if self.device.is_services_resolved().await? {
                return Ok(());
            }
            sleep(Duration::from_millis(SERVICE_RESOLVE_INTERVAL_MS)).await;
        }
        Err(TransportError::Connection(format!(
            "services of {} were not resolved",
            self.device.address()
        )))
    }

    async fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        let mut cache = self.characteristics.lock().await;
        if let Some(found) = cache.get(&uuid) {
            return Ok(found.clone());
        }

        for service in self.device.services().await? {
            for characteristic in service.characteristics().await? {
                let char_uuid = characteristic.uuid().await?;
                cache.insert(char_uuid, characteristic);
            }
        }

        cache
            .get(&uuid)
            .cloned()
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }
}

#[async_trait]
impl Transport for BluerTransport {
    fn address(&self) -> Address {
        self.device.address()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.characteristics.lock().await.clear();
        self.device
            .connect()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        self.wait_for_services().await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.characteristics.lock().await.clear();
        if !self.is_connected().await {
            return Ok(());
        }
        self.device
            .disconnect()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }

    async fn is_connected(&self) -> bool {
        match self.device.is_connected().await {
            Ok(connected) => connected,
            Err(e) => {
                warn!("Failed to query link state of {}: {}", self.address(), e);
                false
            }
        }
    }

    async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>, TransportError> {
        let characteristic = self.characteristic(uuid).await?;
        characteristic.read().await.map_err(|e| TransportError::Read {
            uuid,
            message: e.to_string(),
        })
    }

    async fn write_characteristic(&self, uuid: Uuid, data: &[u8]) -> Result<(), TransportError> {
        let characteristic = self.characteristic(uuid).await?;
        characteristic
            .write(data)
            .await
            .map_err(|e| TransportError::Write {
                uuid,
                message: e.to_string(),
            })
    }

    async fn subscribe(&self, uuid: Uuid) -> Result<NotificationStream, TransportError> {
        let characteristic = self.characteristic(uuid).await?;
        let stream = characteristic
            .notify()
            .await
            .map_err(|e| TransportError::Subscribe {
                uuid,
                message: e.to_string(),
            })?;
        Ok(Box::pin(stream))
    }
}
