/// Live acceleration notifications: decoding, velocity integration and buffering
use bluer::{Address, Uuid};
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::bluetooth::characteristics::{self, ACCELERATION_PACKET_LEN};
use crate::bluetooth::transport::{BleBackend, NotificationStream, Transport};
use crate::error::{Error, RegistryError};
use crate::models::AccelerationSample;
use crate::session::ParameterSession;

/// Unsigned reading that corresponds to zero acceleration.
pub const MID_SCALE: f64 = 32768.0;

/// Scale from centered counts to acceleration for a calibration constant.
pub fn conversion_factor(calibration_raw: u64) -> Result<f64, Error> {
    if calibration_raw == 0 {
        return Err(Error::InvalidCalibration(calibration_raw));
    }
    Ok(250_000.0 / (65_536.0 * calibration_raw as f64))
}

/// Decode one notification packet of unsigned 16-bit little-endian samples.
pub fn decode_packet(data: &[u8], factor: f64) -> Result<Vec<f64>, RegistryError> {
    if data.len() != ACCELERATION_PACKET_LEN {
        return Err(RegistryError::MalformedPayload {
            expected: ACCELERATION_PACKET_LEN,
            actual: data.len(),
        });
    }
    Ok(data
        .chunks_exact(2)
        .map(|pair| (f64::from(u16::from_le_bytes([pair[0], pair[1]])) - MID_SCALE) * factor)
        .collect())
}

/// Bounded FIFO of aggregated samples with a running velocity integral.
#[derive(Debug, Clone)]
pub struct AccelerationBuffer {
    capacity: usize,
    samples: VecDeque<AccelerationSample>,
    // survives eviction so the integral stays continuous
    last: Option<(f64, f64)>,
    // shared by every decoder until cleared, so restarts keep time moving forward
    origin: Option<Instant>,
}

impl AccelerationBuffer {
    pub fn new(capacity: usize) -> Self {
        AccelerationBuffer {
            capacity: capacity.max(1),
            samples: VecDeque::with_capacity(capacity.max(1)),
            last: None,
            origin: None,
        }
    }

    /// Append a packet's decoded values received at `timestamp` seconds.
    pub fn push(&mut self, timestamp: f64, values: Vec<f64>) -> AccelerationSample {
        let raw_mean = if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        };
        let velocity = match self.last {
            Some((previous_time, previous_velocity)) => {
                previous_velocity + raw_mean * (timestamp - previous_time)
            }
            None => 0.0,
        };
        self.last = Some((timestamp, velocity));

        let sample = AccelerationSample {
            timestamp,
            raw_mean,
            velocity,
            raw_values: values,
        };
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample.clone());
        sample
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&AccelerationSample> {
        self.samples.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AccelerationSample> {
        self.samples.iter()
    }

    /// Seconds since the first packet after the last clear.
    pub fn elapsed(&mut self) -> f64 {
        self.origin
            .get_or_insert_with(Instant::now)
            .elapsed()
            .as_secs_f64()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.last = None;
        self.origin = None;
    }
}

/// Shared view of a device's acceleration buffer.
///
/// Readers take a copy with [`snapshot`](Self::snapshot) instead of
/// iterating under the lock while notifications keep arriving.
#[derive(Debug, Clone)]
pub struct SampleBuffer(Arc<Mutex<AccelerationBuffer>>);

impl SampleBuffer {
    pub fn new(buffer: AccelerationBuffer) -> Self {
        SampleBuffer(Arc::new(Mutex::new(buffer)))
    }

    fn lock(&self) -> MutexGuard<'_, AccelerationBuffer> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, timestamp: f64, values: Vec<f64>) -> AccelerationSample {
        self.lock().push(timestamp, values)
    }

    /// Append values stamped with the buffer's own clock.
    pub fn push_now(&self, values: Vec<f64>) -> AccelerationSample {
        let mut buffer = self.lock();
        let timestamp = buffer.elapsed();
        buffer.push(timestamp, values)
    }

    pub fn snapshot(&self) -> Vec<AccelerationSample> {
        self.lock().iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<AccelerationSample> {
        self.lock().latest().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// Running notification subscription; stopping it drops the stream.
#[derive(Debug)]
pub struct StreamHandle {
    characteristic: Uuid,
    task: JoinHandle<()>,
}

impl StreamHandle {
    pub fn characteristic(&self) -> Uuid {
        self.characteristic
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Consume `notifications` in the background, appending one sample per packet.
///
/// Malformed packets are logged and dropped; the subscription continues.
pub fn spawn_decoder(
    address: Address,
    characteristic: Uuid,
    mut notifications: NotificationStream,
    factor: f64,
    buffer: SampleBuffer,
) -> StreamHandle {
    let task = tokio::spawn(async move {
        while let Some(packet) = notifications.next().await {
            match decode_packet(&packet, factor) {
                Ok(values) => {
                    buffer.push_now(values);
                }
                Err(e) => warn!("Dropping acceleration packet from {}: {}", address, e),
            }
        }
        debug!("Acceleration stream of {} ended", address);
    });

    StreamHandle {
        characteristic,
        task,
    }
}

impl<B: BleBackend> ParameterSession<B> {
    /// Subscribe to acceleration notifications.
    ///
    /// The calibration constant is read once per call. Starting an already
    /// running stream just returns its buffer.
    pub async fn start_stream(&self) -> Result<SampleBuffer, Error> {
        self.ensure_open()?;
        if self.device.stream_running() {
            return Ok(self.device.samples());
        }

        let address = self.address();
        let calibration_bytes = self
            .supervisor
            .read(address, characteristics::CALIBRATION)
            .await?;
        let calibration = characteristics::decode_calibration(&calibration_bytes)?;
        let factor = conversion_factor(calibration)?;

        let transport = self.supervisor.ensure_connected(address).await?;
        let notifications = transport
            .subscribe(characteristics::ACCELERATION_DATA)
            .await?;
        self.ensure_open()?;

        let handle = spawn_decoder(
            address,
            characteristics::ACCELERATION_DATA,
            notifications,
            factor,
            self.device.samples(),
        );
        self.device.install_stream(handle);
        info!(
            "Streaming acceleration from {} (calibration {}, factor {:.6})",
            address, calibration, factor
        );
        Ok(self.device.samples())
    }

    /// Unsubscribe from acceleration notifications; returns whether one was running.
    pub fn stop_stream(&self) -> bool {
        self.device.stop_stream()
    }

    pub fn samples(&self) -> SampleBuffer {
        self.device.samples()
    }
}
