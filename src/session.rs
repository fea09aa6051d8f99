/// Parameter editing state of one open device and the operations on it
use bluer::{Address, Uuid};
use futures_util::future::join_all;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::bluetooth::characteristics::{self, DeviceAction};
use crate::bluetooth::transport::BleBackend;
use crate::error::{Error, RegistryError};
use crate::models::{
    CommitOperation, DeviceReadings, ParameterStatus, ParameterView, SessionEvent,
};
use crate::registry::{self, ParameterDef, PARAMETERS, TRACE_LEN_KEY, TRIGGER_DELAY_KEY};
use crate::stream::{AccelerationBuffer, SampleBuffer, StreamHandle};
use crate::supervisor::ConnectionSupervisor;
use crate::utils::hex;

#[derive(Debug, Default)]
struct SessionState {
    raw_values: HashMap<&'static str, u64>,
    display_values: HashMap<&'static str, String>,
    staged_values: HashMap<&'static str, String>,
    statuses: HashMap<&'static str, ParameterStatus>,
    notification_active: HashSet<Uuid>,
}

impl SessionState {
    fn apply_raw(&mut self, param: &ParameterDef, raw: u64) {
        self.raw_values.insert(param.key, raw);
        self.display_values.insert(param.key, param.label_for(raw));
        self.refresh_derived();
    }

    // trigger_delay is shown relative to trace_len, so either one changing
    // invalidates its display value
    fn refresh_derived(&mut self) {
        if let Some(delay) = self.raw_values.get(TRIGGER_DELAY_KEY).copied() {
            let trace_len = self.raw_values.get(TRACE_LEN_KEY).copied();
            self.display_values.insert(
                TRIGGER_DELAY_KEY,
                registry::trigger_delay_display(delay, trace_len),
            );
        }
    }
}

/// Everything known about one device while its view is open.
///
/// Owned by the [`ConnectionSupervisor`] and reused across close/open so
/// that a reopened view starts from a clean slate without a new allocation.
/// Results of operations started under an older `epoch` are discarded.
pub struct DeviceSession {
    address: Address,
    open: AtomicBool,
    epoch: AtomicU64,
    state: Mutex<SessionState>,
    write_locks: HashMap<&'static str, tokio::sync::Mutex<()>>,
    commit_in_flight: AtomicBool,
    last_commit: Mutex<Option<CommitOperation>>,
    stream: Mutex<Option<StreamHandle>>,
    samples: SampleBuffer,
}

impl DeviceSession {
    pub fn new(address: Address, stream_capacity: usize) -> Self {
        DeviceSession {
            address,
            open: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            state: Mutex::new(SessionState::default()),
            write_locks: PARAMETERS
                .iter()
                .map(|param| (param.key, tokio::sync::Mutex::new(())))
                .collect(),
            commit_in_flight: AtomicBool::new(false),
            last_commit: Mutex::new(None),
            stream: Mutex::new(None),
            samples: SampleBuffer::new(AccelerationBuffer::new(stream_capacity)),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a fresh view and return its epoch.
    fn begin(&self) -> u64 {
        self.reset();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.open.store(true, Ordering::SeqCst);
        epoch
    }

    fn end(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.reset();
    }

    fn reset(&self) {
        self.stop_stream();
        *self.state() = SessionState::default();
        self.samples.clear();
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.is_open() && self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn set_status(&self, key: &'static str, status: ParameterStatus) {
        self.state().statuses.insert(key, status);
    }

    pub(crate) fn stop_stream(&self) -> bool {
        let handle = self
            .stream
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.state()
            .notification_active
            .remove(&characteristics::ACCELERATION_DATA);
        match handle {
            Some(handle) => {
                handle.stop();
                true
            }
            None => false,
        }
    }

    pub(crate) fn install_stream(&self, handle: StreamHandle) {
        self.state().notification_active.insert(handle.characteristic());
        if let Some(old) = self
            .stream
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle)
        {
            old.stop();
        }
    }

    pub(crate) fn stream_running(&self) -> bool {
        self.stream
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn samples(&self) -> SampleBuffer {
        self.samples.clone()
    }

    pub fn notification_active(&self) -> HashSet<Uuid> {
        self.state().notification_active.clone()
    }

    /// Claim the per-device commit slot.
    pub(crate) fn begin_commit(&self) -> Result<(), Error> {
        self.commit_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| Error::CommitInProgress(self.address))
    }

    pub(crate) fn finish_commit(&self) {
        self.commit_in_flight.store(false, Ordering::SeqCst);
    }

    pub fn commit_in_flight(&self) -> bool {
        self.commit_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn record_commit(&self, operation: CommitOperation) {
        *self.last_commit.lock().unwrap_or_else(|e| e.into_inner()) = Some(operation);
    }

    pub fn last_commit(&self) -> Option<CommitOperation> {
        self.last_commit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Handle to an open device view.
///
/// Cheap to clone; every transport access goes back through the
/// supervisor so a reconnect is always picked up.
pub struct ParameterSession<B: BleBackend> {
    pub(crate) supervisor: Arc<ConnectionSupervisor<B>>,
    pub(crate) device: Arc<DeviceSession>,
    pub(crate) epoch: u64,
}

impl<B: BleBackend> Clone for ParameterSession<B> {
    fn clone(&self) -> Self {
        ParameterSession {
            supervisor: self.supervisor.clone(),
            device: self.device.clone(),
            epoch: self.epoch,
        }
    }
}

impl<B: BleBackend> ParameterSession<B> {
    /// Connect to `address` and read every registered parameter.
    ///
    /// Individual read failures do not fail the open; they show up as
    /// [`ParameterStatus::ReadFailed`] for that parameter.
    pub async fn open(
        supervisor: Arc<ConnectionSupervisor<B>>,
        address: Address,
    ) -> Result<Self, Error> {
        supervisor.connect(address).await?;
        let device = supervisor.session(address);
        let epoch = device.begin();
        let session = ParameterSession {
            supervisor,
            device,
            epoch,
        };

        let results = session.read_all().await;
        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        info!(
            "Opened {}: {} parameter(s) fetched, {} failed",
            address,
            results.len() - failed,
            failed
        );
        Ok(session)
    }

    pub fn address(&self) -> Address {
        self.device.address()
    }

    pub fn device(&self) -> &Arc<DeviceSession> {
        &self.device
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor<B>> {
        &self.supervisor
    }

    pub fn is_open(&self) -> bool {
        self.device.is_current(self.epoch)
    }

    pub(crate) fn ensure_open(&self) -> Result<(), Error> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::SessionClosed(self.address()))
        }
    }

    /// Read all parameters concurrently; each result is independent.
    pub async fn read_all(&self) -> Vec<(&'static str, Result<u64, Error>)> {
        let reads = PARAMETERS.iter().map(|param| async move {
            (param.key, self.read_parameter(param.key).await)
        });
        join_all(reads).await
    }

    /// Read one parameter from the device and update its raw and display value.
    pub async fn read_parameter(&self, key: &str) -> Result<u64, Error> {
        self.ensure_open()?;
        let param = registry::lookup(key)?;

        let result = match self.supervisor.read(self.address(), param.characteristic).await {
            Ok(bytes) => param.decode(&bytes).map_err(Error::from),
            Err(e) => Err(e),
        };

        if !self.device.is_current(self.epoch) {
            debug!("Discarding read of {} for closed view of {}", key, self.address());
            return Err(Error::SessionClosed(self.address()));
        }

        let status = match &result {
            Ok(raw) => {
                self.device.state().apply_raw(param, *raw);
                debug!("Read {} = {} from {}", param.key, raw, self.address());
                ParameterStatus::Fetched
            }
            Err(e) => {
                warn!("Failed to read {} from {}: {}", param.key, self.address(), e);
                ParameterStatus::ReadFailed(e.to_string())
            }
        };
        self.device.set_status(param.key, status.clone());
        self.supervisor.publish(SessionEvent::ParameterUpdated {
            address: self.address(),
            key: param.key,
            status,
        });
        result
    }

    /// Record an operator value for `key` without writing it.
    pub fn stage(&self, key: &str, label: &str) -> Result<(), Error> {
        self.ensure_open()?;
        let param = registry::lookup(key)?;
        resolve_raw(param, label)?;
        self.device
            .state()
            .staged_values
            .insert(param.key, label.trim().to_string());
        Ok(())
    }

    pub fn staged(&self) -> HashMap<&'static str, String> {
        self.device.state().staged_values.clone()
    }

    /// Write the value labelled `label` to `key`.
    ///
    /// On success the written value becomes the local source of truth; it
    /// is not read back. On failure the previous raw, display and staged
    /// values are left untouched. Writes to the same key are applied in
    /// submission order.
    pub async fn write_parameter(&self, key: &str, label: &str) -> Result<u64, Error> {
        self.ensure_open()?;
        let param = registry::lookup(key)?;
        let raw = resolve_raw(param, label)?;
        let payload = param.encode(raw).map_err(|source| Error::InvalidValue {
            key: param.key.to_string(),
            source,
        })?;

        let _serialized = match self.device.write_locks.get(param.key) {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        self.ensure_open()?;
        self.device.set_status(param.key, ParameterStatus::Writing);

        let result = self
            .supervisor
            .write_with_retry(self.address(), param.characteristic, &payload, || {
                if self.device.is_current(self.epoch) {
                    self.device.set_status(param.key, ParameterStatus::Retrying)
                }
            })
            .await;

        if !self.device.is_current(self.epoch) {
            debug!("Discarding write of {} for closed view of {}", key, self.address());
            return Err(Error::SessionClosed(self.address()));
        }

        let (status, result) = match result {
            Ok(()) => {
                let mut state = self.device.state();
                state.apply_raw(param, raw);
                state.staged_values.remove(param.key);
                info!(
                    "Wrote {} ({}) to {} on {} as bytes: {}",
                    raw,
                    label.trim(),
                    param.key,
                    self.address(),
                    hex(&payload)
                );
                (ParameterStatus::Written, Ok(raw))
            }
            Err(Error::Transport(source)) => {
                warn!("Failed to write {} on {}: {}", param.key, self.address(), source);
                (
                    ParameterStatus::WriteFailed(source.to_string()),
                    Err(Error::WriteFailed {
                        key: param.key.to_string(),
                        source,
                    }),
                )
            }
            Err(e) => {
                warn!("Failed to write {} on {}: {}", param.key, self.address(), e);
                (ParameterStatus::WriteFailed(e.to_string()), Err(e))
            }
        };

        self.device.set_status(param.key, status.clone());
        self.supervisor.publish(SessionEvent::ParameterUpdated {
            address: self.address(),
            key: param.key,
            status,
        });
        result
    }

    /// Write every staged value concurrently; partial success is expected.
    pub async fn write_staged(&self) -> Vec<(&'static str, Result<u64, Error>)> {
        let staged = self.staged();
        let writes = staged.into_iter().map(|(key, label)| async move {
            (key, self.write_parameter(key, &label).await)
        });
        join_all(writes).await
    }

    pub fn raw_value(&self, key: &str) -> Option<u64> {
        self.device.state().raw_values.get(key).copied()
    }

    pub fn display_value(&self, key: &str) -> Option<String> {
        self.device.state().display_values.get(key).cloned()
    }

    pub fn status(&self, key: &str) -> ParameterStatus {
        self.device
            .state()
            .statuses
            .get(key)
            .cloned()
            .unwrap_or(ParameterStatus::Waiting)
    }

    /// One row per registered parameter, in registry order.
    pub fn parameters(&self) -> Vec<ParameterView> {
        let state = self.device.state();
        PARAMETERS
            .iter()
            .map(|param| ParameterView {
                key: param.key,
                display_name: param.display_name,
                raw: state.raw_values.get(param.key).copied(),
                display: state.display_values.get(param.key).cloned(),
                staged: state.staged_values.get(param.key).cloned(),
                status: state
                    .statuses
                    .get(param.key)
                    .cloned()
                    .unwrap_or(ParameterStatus::Waiting),
            })
            .collect()
    }

    /// Read temperature, battery and device clock; failures become `None`.
    pub async fn read_readings(&self) -> Result<DeviceReadings, Error> {
        self.ensure_open()?;
        let address = self.address();

        let (temperature, battery, clock) = tokio::join!(
            self.supervisor.read(address, characteristics::TEMPERATURE),
            self.supervisor.read(address, characteristics::BATTERY),
            self.supervisor.read(address, characteristics::DEVICE_TIME),
        );

        let temperature_c = reading(
            address,
            "temperature",
            temperature,
            characteristics::decode_temperature,
        );
        let battery_v = reading(address, "battery", battery, characteristics::decode_battery);
        let device_time = reading(
            address,
            "device time",
            clock,
            characteristics::decode_device_time,
        );

        Ok(DeviceReadings {
            temperature_c,
            battery_v,
            device_time,
        })
    }

    /// Trigger a one-shot device action (power off, factory reset, restart).
    pub async fn send_action(&self, action: DeviceAction) -> Result<(), Error> {
        self.ensure_open()?;
        let result = self
            .supervisor
            .write_with_retry(
                self.address(),
                action.characteristic(),
                &characteristics::TRIGGER_PAYLOAD,
                || {},
            )
            .await;

        match result {
            Ok(()) => {
                info!("Sent {} to {}", action.label(), self.address());
                Ok(())
            }
            Err(Error::Transport(source)) => {
                warn!("Failed to send {} to {}: {}", action.label(), self.address(), source);
                Err(Error::WriteFailed {
                    key: action.label().to_string(),
                    source,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Close the view: stop notifications and drop all local state.
    ///
    /// In-flight reads and writes are not awaited; their results are
    /// discarded. The supervisor keeps its link for a fast reopen.
    pub fn close(&self) {
        if self.device.is_current(self.epoch) {
            self.device.end();
            info!("Closed view of {}", self.address());
        }
    }
}

fn resolve_raw(param: &ParameterDef, label: &str) -> Result<u64, Error> {
    param.raw_for(label).map_err(|source| Error::InvalidValue {
        key: param.key.to_string(),
        source,
    })
}

fn reading<T>(
    address: Address,
    what: &str,
    result: Result<Vec<u8>, Error>,
    decode: impl FnOnce(&[u8]) -> Result<T, RegistryError>,
) -> Option<T> {
    match result.and_then(|data| decode(&data).map_err(Error::from)) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Failed to read {} from {}: {}", what, address, e);
            None
        }
    }
}
