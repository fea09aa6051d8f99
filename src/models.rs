use bluer::Address;
use time::{OffsetDateTime, Time};

/// Device seen during a discovery scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: Address,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Per-parameter outcome of the last read or write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterStatus {
    Waiting,
    Fetched,
    ReadFailed(String),
    Writing,
    Retrying,
    Written,
    WriteFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitStatus {
    Pending,
    RetryingAfterTimeout,
    Succeeded,
    Failed(String),
}

impl CommitStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommitStatus::Succeeded | CommitStatus::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitOperation {
    pub target_address: Address,
    pub start_time: OffsetDateTime,
    pub status: CommitStatus,
}

/// Aggregate of one acceleration notification packet.
#[derive(Debug, Clone, PartialEq)]
pub struct AccelerationSample {
    pub timestamp: f64,
    pub raw_mean: f64,
    pub velocity: f64,
    pub raw_values: Vec<f64>,
}

/// Snapshot of one editor row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterView {
    pub key: &'static str,
    pub display_name: &'static str,
    pub raw: Option<u64>,
    pub display: Option<String>,
    pub staged: Option<String>,
    pub status: ParameterStatus,
}

/// Read-only measurements; each is `None` when its read failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceReadings {
    pub temperature_c: Option<f64>,
    pub battery_v: Option<f64>,
    pub device_time: Option<Time>,
}

/// Notifications published to front ends.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionChanged {
        address: Address,
        state: ConnectionState,
    },
    ParameterUpdated {
        address: Address,
        key: &'static str,
        status: ParameterStatus,
    },
    Committed {
        address: Address,
    },
    CommitFailed {
        address: Address,
        reason: String,
    },
}
