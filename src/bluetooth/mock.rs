/// Scripted in-memory backend for exercising the session layer in tests
use async_trait::async_trait;
use bluer::{Address, Uuid};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::bluetooth::characteristics;
use crate::bluetooth::transport::{BleBackend, NotificationStream, Transport};
use crate::error::TransportError;
use crate::models::DiscoveredDevice;

pub const SENSOR: Address = Address([0xFA, 0xE2, 0xAD, 0xE2, 0x8D, 0x99]);
pub const OTHER_SENSOR: Address = Address([0xFB, 0x0C, 0x16, 0x50, 0x98, 0xDB]);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteBehavior {
    Ok,
    Hang,
    Fail(String),
}

#[derive(Debug, Default)]
struct MockState {
    advertised: Vec<DiscoveredDevice>,
    reads: HashMap<Uuid, Vec<u8>>,
    read_failures: HashSet<Uuid>,
    writes: HashMap<Uuid, VecDeque<WriteBehavior>>,
    written: Vec<(Uuid, Vec<u8>)>,
    failing_connects: usize,
    scan_duration: Duration,
    notifiers: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    discoveries: usize,
    connects: usize,
    transports_created: usize,
    disconnects: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
    link_generation: Arc<AtomicU64>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// One advertising BluVib sensor holding a plausible configuration.
    pub fn with_sample_sensor() -> Self {
        let backend = Self::new();
        backend.advertise(SENSOR, "BluVib-40", -61);
        backend.set_read(characteristics::AXES, &[3]);
        backend.set_read(characteristics::SAMPLE_RATE, &[3]);
        backend.set_read(characteristics::GAIN, &[4]);
        backend.set_read(characteristics::MODE, &[1]);
        backend.set_read(characteristics::HOLDOFF_INTERVAL, &[0x2C, 0x01]);
        backend.set_read(characteristics::WAKEUP_INTERVAL, &[0x3C, 0x00]);
        // code 2 -> 256 samples
        backend.set_read(characteristics::TRACE_LEN, &[2]);
        backend.set_read(characteristics::TRIGGER_DELAY, &[0x40, 0x00]);
        backend.set_read(characteristics::CALIBRATION, &[0x01, 0x00]);
        backend.set_read(characteristics::TEMPERATURE, &[0x64, 0x00]);
        backend.set_read(characteristics::BATTERY, &[0xE4, 0x0C]);
        backend.set_read(characteristics::DEVICE_TIME, &[13, 45, 7]);
        backend
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn advertise(&self, address: Address, name: &str, rssi: i16) {
        self.lock().advertised.push(DiscoveredDevice {
            address,
            name: Some(name.to_string()),
            rssi: Some(rssi),
        });
    }

    pub fn stop_advertising(&self) {
        self.lock().advertised.clear();
    }

    pub fn set_read(&self, uuid: Uuid, data: &[u8]) {
        self.lock().reads.insert(uuid, data.to_vec());
    }

    pub fn fail_read(&self, uuid: Uuid) {
        self.lock().read_failures.insert(uuid);
    }

    /// Queue the outcomes of the next writes to `uuid`; unqueued writes succeed.
    pub fn script_writes(&self, uuid: Uuid, behaviors: impl IntoIterator<Item = WriteBehavior>) {
        self.lock()
            .writes
            .entry(uuid)
            .or_default()
            .extend(behaviors);
    }

    /// Make each discovery scan take `duration`, as a real scan does.
    pub fn set_scan_duration(&self, duration: Duration) {
        self.lock().scan_duration = duration;
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.lock().failing_connects = count;
    }

    /// Simulate every open link silently going away.
    pub fn drop_links(&self) {
        self.link_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Push one notification payload to every live subscriber.
    pub fn notify(&self, data: &[u8]) {
        self.lock()
            .notifiers
            .retain(|tx| tx.send(data.to_vec()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.notifiers.retain(|tx| !tx.is_closed());
        state.notifiers.len()
    }

    pub fn written(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.lock().written.clone()
    }

    pub fn discoveries(&self) -> usize {
        self.lock().discoveries
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn transports_created(&self) -> usize {
        self.lock().transports_created
    }

    pub fn disconnects(&self) -> usize {
        self.lock().disconnects
    }
}

#[async_trait]
impl BleBackend for MockBackend {
    type Transport = MockTransport;

    async fn discover(&self, _timeout: Duration) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let duration = {
            let mut state = self.lock();
            state.discoveries += 1;
            state.scan_duration
        };
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
        Ok(self.lock().advertised.clone())
    }

    fn create_transport(&self, address: Address) -> Result<MockTransport, TransportError> {
        self.lock().transports_created += 1;
        Ok(MockTransport {
            address,
            backend: self.clone(),
            connected: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        })
    }
}

#[derive(Debug)]
pub struct MockTransport {
    address: Address,
    backend: MockBackend,
    connected: AtomicBool,
    generation: AtomicU64,
}

#[async_trait]
impl Transport for MockTransport {
    fn address(&self) -> Address {
        self.address
    }

    async fn connect(&self) -> Result<(), TransportError> {
        {
            let mut state = self.backend.lock();
            state.connects += 1;
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(TransportError::Connection("le-connection-abort-by-local".into()));
            }
        }
        self.generation.store(
            self.backend.link_generation.load(Ordering::SeqCst),
            Ordering::SeqCst,
        );
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.backend.lock().disconnects += 1;
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
            && self.generation.load(Ordering::SeqCst)
                == self.backend.link_generation.load(Ordering::SeqCst)
    }

    async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>, TransportError> {
        if !self.is_connected().await {
            return Err(TransportError::NotConnected);
        }
        let state = self.backend.lock();
        if state.read_failures.contains(&uuid) {
            return Err(TransportError::Read {
                uuid,
                message: "ATT error 0x0e".into(),
            });
        }
        state
            .reads
            .get(&uuid)
            .cloned()
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }

    async fn write_characteristic(&self, uuid: Uuid, data: &[u8]) -> Result<(), TransportError> {
        let behavior = self
            .backend
            .lock()
            .writes
            .get_mut(&uuid)
            .and_then(VecDeque::pop_front)
            .unwrap_or(WriteBehavior::Ok);

        match behavior {
            WriteBehavior::Ok => {
                self.backend.lock().written.push((uuid, data.to_vec()));
                Ok(())
            }
            WriteBehavior::Hang => std::future::pending().await,
            WriteBehavior::Fail(message) => Err(TransportError::Write { uuid, message }),
        }
    }

    async fn subscribe(&self, _uuid: Uuid) -> Result<NotificationStream, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.backend.lock().notifiers.push(tx);
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|data| (data, rx))
        });
        Ok(Box::pin(stream))
    }
}
