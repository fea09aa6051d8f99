/// Error types for the registry, the BLE transport and the session layer
use bluer::{Address, Uuid};
use std::time::Duration;
use thiserror::Error;

/// Misuse of the parameter registry or a malformed wire payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("value {value} does not fit in {width} byte(s) for {key}")]
    ValueOutOfRange {
        key: String,
        value: u64,
        width: usize,
    },

    #[error("malformed payload: expected {expected} byte(s), got {actual}")]
    MalformedPayload { expected: usize, actual: usize },

    #[error("label {label:?} is not a valid value for {key}")]
    LabelNotFound { key: String, label: String },

    #[error("{input:?} is not a valid number for {key}")]
    InvalidNumber { key: String, input: String },
}

/// Failure reported by a BLE transport or discovery backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("read of {uuid} failed: {message}")]
    Read { uuid: Uuid, message: String },

    #[error("write to {uuid} failed: {message}")]
    Write { uuid: Uuid, message: String },

    #[error("write to {uuid} timed out after {}s", .after.as_secs())]
    Timeout { uuid: Uuid, after: Duration },

    #[error("subscribe to {uuid} failed: {message}")]
    Subscribe { uuid: Uuid, message: String },

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("transport is not connected")]
    NotConnected,

    #[error("characteristic {0} not found on device")]
    CharacteristicNotFound(Uuid),
}

impl From<bluer::Error> for TransportError {
    fn from(e: bluer::Error) -> Self {
        TransportError::Connection(e.to_string())
    }
}

/// Error returned by supervisor, session and commit operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("device {0} was not found during scan")]
    DeviceNotPresent(Address),

    #[error("device {address} is present but reconnecting failed: {source}")]
    ReconnectFailed {
        address: Address,
        source: TransportError,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("invalid value for {key}: {source}")]
    InvalidValue { key: String, source: RegistryError },

    #[error("write of {key} failed: {source}")]
    WriteFailed { key: String, source: TransportError },

    #[error("a commit is already in progress for {0}")]
    CommitInProgress(Address),

    #[error("commit to {address} failed: {source}")]
    CommitFailed {
        address: Address,
        source: TransportError,
    },

    #[error("calibration constant {0} cannot be used for conversion")]
    InvalidCalibration(u64),

    #[error("session for {0} was closed")]
    SessionClosed(Address),
}

impl Error {
    /// True when the underlying cause is a bounded write that timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Transport(TransportError::Timeout { .. })
                | Error::WriteFailed {
                    source: TransportError::Timeout { .. },
                    ..
                }
                | Error::CommitFailed {
                    source: TransportError::Timeout { .. },
                    ..
                }
        )
    }

    /// Short operator-facing status for a front end.
    pub fn status_text(&self) -> &'static str {
        match self {
            Error::Transport(TransportError::NotConnected) => "Not connected",
            Error::DeviceNotPresent(_) => "Sensor not found",
            Error::ReconnectFailed { .. } => "Reconnection failed",
            e if e.is_timeout() => "Write timed out, reconnecting",
            Error::WriteFailed { .. } | Error::Transport(TransportError::Write { .. }) => {
                "Write failed"
            }
            Error::Transport(TransportError::Read { .. }) => "Read failed",
            Error::Transport(_) => "Connection error",
            Error::Registry(_) | Error::InvalidValue { .. } => "Invalid value",
            Error::CommitInProgress(_) => "Commit in progress",
            Error::CommitFailed { .. } => "Commit failed",
            Error::InvalidCalibration(_) => "Invalid calibration",
            Error::SessionClosed(_) => "Session closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> Address {
        Address([0xFA, 0xE2, 0xAD, 0xE2, 0x8D, 0x99])
    }

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::UnknownParameter("window".to_string());
        assert_eq!(err.to_string(), "unknown parameter: window");

        let err = RegistryError::ValueOutOfRange {
            key: "gain".to_string(),
            value: 300,
            width: 1,
        };
        assert_eq!(err.to_string(), "value 300 does not fit in 1 byte(s) for gain");

        let err = RegistryError::MalformedPayload {
            expected: 2,
            actual: 3,
        };
        assert_eq!(err.to_string(), "malformed payload: expected 2 byte(s), got 3");
    }

    #[test]
    fn test_device_not_present_display() {
        let err = Error::DeviceNotPresent(address());
        assert_eq!(
            err.to_string(),
            "device FA:E2:AD:E2:8D:99 was not found during scan"
        );
        assert_eq!(err.status_text(), "Sensor not found");
    }

    #[test]
    fn test_status_text_distinguishes_timeout_from_write_failure() {
        let uuid = Uuid::from_u128(0x1c930030_d459_11e7_9296_b8e856369374);
        let timed_out = Error::WriteFailed {
            key: "gain".to_string(),
            source: TransportError::Timeout {
                uuid,
                after: Duration::from_secs(5),
            },
        };
        let failed = Error::WriteFailed {
            key: "gain".to_string(),
            source: TransportError::Write {
                uuid,
                message: "GATT error".to_string(),
            },
        };

        assert!(timed_out.is_timeout());
        assert!(!failed.is_timeout());
        assert_eq!(timed_out.status_text(), "Write timed out, reconnecting");
        assert_eq!(failed.status_text(), "Write failed");
        assert_eq!(
            Error::Transport(TransportError::NotConnected).status_text(),
            "Not connected"
        );
    }
}
