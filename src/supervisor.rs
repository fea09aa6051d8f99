/// Per-address ownership of BLE transports and the bounded write/retry path
use bluer::{Address, Uuid};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, MutexGuard};
use tokio::time::timeout;

use crate::bluetooth::scanner;
use crate::bluetooth::transport::{BleBackend, Transport};
use crate::config::SessionConfig;
use crate::error::{Error, TransportError};
use crate::models::{ConnectionState, DiscoveredDevice, SessionEvent};
use crate::session::DeviceSession;

const EVENT_CHANNEL_CAPACITY: usize = 64;

struct Link<T> {
    transport: Option<Arc<T>>,
    stale: bool,
    // outcome of the last finished reconnect attempt, if it failed
    last_failure: Option<Error>,
}

/// A link plus a count of finished reconnect attempts, readable without the lock.
struct LinkSlot<T> {
    attempts: AtomicU64,
    link: tokio::sync::Mutex<Link<T>>,
}

impl<T> Default for LinkSlot<T> {
    fn default() -> Self {
        LinkSlot {
            attempts: AtomicU64::new(0),
            link: tokio::sync::Mutex::new(Link {
                transport: None,
                stale: false,
                last_failure: None,
            }),
        }
    }
}

impl<T> LinkSlot<T> {
    async fn lock(&self) -> MutexGuard<'_, Link<T>> {
        self.link.lock().await
    }
}

/// Owns one transport per device address.
///
/// Only `connect`, `ensure_connected` and `disconnect` replace a stored
/// transport. Callers must re-fetch the handle through `ensure_connected`
/// instead of holding one across a reconnect.
pub struct ConnectionSupervisor<B: BleBackend> {
    backend: B,
    config: SessionConfig,
    links: Mutex<HashMap<Address, Arc<LinkSlot<B::Transport>>>>,
    states: Mutex<HashMap<Address, ConnectionState>>,
    sessions: Mutex<HashMap<Address, Arc<DeviceSession>>>,
    events: broadcast::Sender<SessionEvent>,
}

impl<B: BleBackend> ConnectionSupervisor<B> {
    pub fn new(backend: B, config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        ConnectionSupervisor {
            backend,
            config,
            links: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: SessionEvent) {
        // No receivers is fine, the front end may not be listening
        let _ = self.events.send(event);
    }

    /// Scan and return configuration candidates, strongest signal first.
    pub async fn discover(&self) -> Result<Vec<DiscoveredDevice>, Error> {
        let devices = self.discover_all().await?;
        Ok(scanner::candidates(devices, &self.config.name_prefix))
    }

    /// Scan and return every advertising device.
    pub async fn discover_all(&self) -> Result<Vec<DiscoveredDevice>, Error> {
        let devices = self.backend.discover(self.config.discovery_timeout).await?;
        debug!("Discovery found {} device(s)", devices.len());
        Ok(devices)
    }

    /// State tracked for `address`; unknown addresses are disconnected.
    pub fn state(&self, address: Address) -> ConnectionState {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(&address).copied())
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn set_state(&self, address: Address, state: ConnectionState) {
        let changed = match self.states.lock() {
            Ok(mut states) => states.insert(address, state) != Some(state),
            Err(_) => false,
        };
        if changed {
            debug!("{} is now {:?}", address, state);
            self.publish(SessionEvent::ConnectionChanged { address, state });
        }
    }

    fn link(&self, address: Address) -> Arc<LinkSlot<B::Transport>> {
        let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        links.entry(address).or_default().clone()
    }

    /// Session state for `address`, created on first use and kept across closes.
    pub fn session(&self, address: Address) -> Arc<DeviceSession> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .entry(address)
            .or_insert_with(|| Arc::new(DeviceSession::new(address, self.config.stream_capacity)))
            .clone()
    }

    /// Whether the stored transport reports a live link.
    ///
    /// A link found dead while marked connected settles to `Disconnected`.
    pub async fn is_connected(&self, address: Address) -> bool {
        let link = self.link(address);
        let link = link.lock().await;
        let connected = match &link.transport {
            Some(transport) => !link.stale && transport.is_connected().await,
            None => false,
        };
        if !connected && self.state(address) == ConnectionState::Connected {
            warn!("Link to {} was lost", address);
            self.set_state(address, ConnectionState::Disconnected);
        }
        connected
    }

    /// Connect to `address`, doing nothing if already connected.
    pub async fn connect(&self, address: Address) -> Result<Arc<B::Transport>, Error> {
        let link = self.link(address);
        let mut link = link.lock().await;

        if let Some(transport) = &link.transport {
            if !link.stale && transport.is_connected().await {
                return Ok(transport.clone());
            }
        }

        self.set_state(address, ConnectionState::Connecting);
        if let Some(old) = link.transport.take() {
            self.release(address, old.as_ref()).await;
        }

        let transport = match self.backend.create_transport(address) {
            Ok(transport) => Arc::new(transport),
            Err(e) => {
                self.set_state(address, ConnectionState::Disconnected);
                return Err(e.into());
            }
        };

        match transport.connect().await {
            Ok(()) => {
                info!("Connected to {}", address);
                link.transport = Some(transport.clone());
                link.stale = false;
                self.set_state(address, ConnectionState::Connected);
                Ok(transport)
            }
            Err(e) => {
                error!("Failed to connect to {}: {}", address, e);
                self.set_state(address, ConnectionState::Disconnected);
                Err(e.into())
            }
        }
    }

    /// Return a live transport for `address`, reconnecting if the link is stale.
    ///
    /// A reconnect is only attempted after a discovery scan has seen the
    /// device advertising. The returned handle replaces any earlier one.
    /// Callers that queued behind a failed attempt get its error instead of
    /// scanning again.
    pub async fn ensure_connected(&self, address: Address) -> Result<Arc<B::Transport>, Error> {
        let slot = self.link(address);
        let seen = slot.attempts.load(Ordering::SeqCst);
        let mut link = slot.lock().await;

        if let Some(transport) = &link.transport {
            if !link.stale && transport.is_connected().await {
                return Ok(transport.clone());
            }
        }

        if slot.attempts.load(Ordering::SeqCst) != seen {
            if let Some(failure) = &link.last_failure {
                debug!("Reusing failed reconnect of {}: {}", address, failure);
                return Err(failure.clone());
            }
        }

        let result = self.reconnect(address, &mut link).await;
        link.last_failure = result.as_ref().err().cloned();
        slot.attempts.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn reconnect(
        &self,
        address: Address,
        link: &mut Link<B::Transport>,
    ) -> Result<Arc<B::Transport>, Error> {
        warn!("Not connected to {}, trying to reconnect", address);
        self.set_state(address, ConnectionState::Reconnecting);

        let devices = match self.backend.discover(self.config.discovery_timeout).await {
            Ok(devices) => devices,
            Err(e) => {
                self.set_state(address, ConnectionState::Disconnected);
                return Err(e.into());
            }
        };
        if !devices.iter().any(|d| d.address == address) {
            warn!("{} was not found during scan", address);
            self.set_state(address, ConnectionState::Disconnected);
            return Err(Error::DeviceNotPresent(address));
        }

        if let Some(old) = link.transport.take() {
            self.release(address, old.as_ref()).await;
        }

        let transport = match self.backend.create_transport(address) {
            Ok(transport) => Arc::new(transport),
            Err(source) => {
                self.set_state(address, ConnectionState::Disconnected);
                return Err(Error::ReconnectFailed { address, source });
            }
        };

        match transport.connect().await {
            Ok(()) => {
                info!("Reconnected successfully to {}", address);
                link.transport = Some(transport.clone());
                link.stale = false;
                self.set_state(address, ConnectionState::Connected);
                Ok(transport)
            }
            Err(source) => {
                error!("Reconnecting {} failed: {}", address, source);
                self.set_state(address, ConnectionState::Disconnected);
                Err(Error::ReconnectFailed { address, source })
            }
        }
    }

    /// Flag the link as stale if `transport` is still the stored handle.
    pub async fn mark_stale(&self, address: Address, transport: &Arc<B::Transport>) {
        let link = self.link(address);
        let mut link = link.lock().await;
        if link
            .transport
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, transport))
        {
            link.stale = true;
        }
    }

    /// Tear down the link; always ends `Disconnected`.
    pub async fn disconnect(&self, address: Address) {
        let link = self.link(address);
        let mut link = link.lock().await;
        if let Some(transport) = link.transport.take() {
            self.release(address, transport.as_ref()).await;
            info!("Disconnected from {}", address);
        }
        link.stale = false;
        self.set_state(address, ConnectionState::Disconnected);
    }

    /// Stop every stream and disconnect every known device.
    pub async fn disconnect_all(&self) {
        let sessions: Vec<Arc<DeviceSession>> = self
            .sessions
            .lock()
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default();
        for session in sessions {
            session.stop_stream();
        }

        let addresses: Vec<Address> = self
            .links
            .lock()
            .map(|links| links.keys().copied().collect())
            .unwrap_or_default();
        for address in addresses {
            self.disconnect(address).await;
        }
    }

    /// Best-effort disconnect of a handle that is being dropped.
    async fn release(&self, address: Address, transport: &B::Transport) {
        match timeout(self.config.write_timeout, transport.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Ignoring disconnect error for {}: {}", address, e),
            Err(_) => warn!("Disconnect of {} did not complete, abandoning handle", address),
        }
    }

    /// Read a characteristic, bounded by the read timeout.
    pub async fn read(&self, address: Address, uuid: Uuid) -> Result<Vec<u8>, Error> {
        let transport = self.ensure_connected(address).await?;
        match timeout(self.config.read_timeout, transport.read_characteristic(uuid)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransportError::Read {
                uuid,
                message: format!("timed out after {}s", self.config.read_timeout.as_secs()),
            }
            .into()),
        }
    }

    async fn bounded_write(
        &self,
        transport: &B::Transport,
        uuid: Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let after = self.config.write_timeout;
        match timeout(after, transport.write_characteristic(uuid, payload)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout { uuid, after }),
        }
    }

    /// Write with a bounded timeout, reconnecting and retrying once on timeout.
    ///
    /// `on_timeout` runs before the forced reconnect. Hard write errors are
    /// returned without a retry. Discovery and reconnect failures propagate
    /// unchanged.
    pub async fn write_with_retry<F>(
        &self,
        address: Address,
        uuid: Uuid,
        payload: &[u8],
        on_timeout: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(),
    {
        let transport = self.ensure_connected(address).await?;
        match self.bounded_write(transport.as_ref(), uuid, payload).await {
            Err(TransportError::Timeout { .. }) => {
                warn!(
                    "Write to {} on {} timed out, assuming disconnect",
                    uuid, address
                );
                on_timeout();
                self.mark_stale(address, &transport).await;
                let transport = self.ensure_connected(address).await?;
                self.bounded_write(transport.as_ref(), uuid, payload)
                    .await
                    .map_err(Error::from)
            }
            other => other.map_err(Error::from),
        }
    }
}
