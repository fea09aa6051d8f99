/// Persisting written parameters to device flash via the commit characteristic
use log::{error, info, warn};
use time::OffsetDateTime;

use crate::bluetooth::characteristics;
use crate::bluetooth::transport::BleBackend;
use crate::error::Error;
use crate::models::{CommitOperation, CommitStatus, SessionEvent};
use crate::session::{DeviceSession, ParameterSession};
use crate::utils::format_datetime;

/// Holds the per-device commit slot and keeps the operation record current.
///
/// Dropping the guard frees the slot, including when the commit future is
/// cancelled mid-flight.
struct CommitGuard<'a> {
    device: &'a DeviceSession,
    operation: CommitOperation,
}

impl<'a> CommitGuard<'a> {
    fn acquire(device: &'a DeviceSession) -> Result<Self, Error> {
        device.begin_commit()?;
        let operation = CommitOperation {
            target_address: device.address(),
            start_time: OffsetDateTime::now_utc(),
            status: CommitStatus::Pending,
        };
        device.record_commit(operation.clone());
        Ok(CommitGuard { device, operation })
    }

    fn set_status(&mut self, status: CommitStatus) {
        self.operation.status = status;
        self.device.record_commit(self.operation.clone());
    }
}

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        if !self.operation.status.is_terminal() {
            self.set_status(CommitStatus::Failed("commit was abandoned".to_string()));
        }
        self.device.finish_commit();
    }
}

impl<B: BleBackend> ParameterSession<B> {
    /// Ask the device to persist its current parameters to flash.
    ///
    /// Only one commit may be in flight per device; a concurrent request
    /// fails with [`Error::CommitInProgress`]. A timed-out write forces a
    /// reconnect and is retried exactly once. Any other failure is final.
    pub async fn commit(&self) -> Result<CommitOperation, Error> {
        self.ensure_open()?;
        let address = self.address();
        let mut guard = CommitGuard::acquire(&self.device)?;
        info!(
            "Committing configuration of {} at {}",
            address,
            format_datetime(&guard.operation.start_time)
        );

        let result = self
            .supervisor
            .write_with_retry(
                address,
                characteristics::COMMIT,
                &characteristics::TRIGGER_PAYLOAD,
                || {
                    warn!("Commit to {} timed out, reconnecting to retry", address);
                    guard.set_status(CommitStatus::RetryingAfterTimeout);
                },
            )
            .await;

        match result {
            Ok(()) => {
                guard.set_status(CommitStatus::Succeeded);
                info!("Commit to {} successful", address);
                self.supervisor.publish(SessionEvent::Committed { address });
                Ok(guard.operation.clone())
            }
            Err(e) => {
                error!("Commit to {} failed: {}", address, e);
                let reason = match &e {
                    Error::Transport(source) => source.to_string(),
                    other => other.to_string(),
                };
                guard.set_status(CommitStatus::Failed(reason.clone()));
                self.supervisor
                    .publish(SessionEvent::CommitFailed { address, reason });
                Err(match e {
                    Error::Transport(source) => Error::CommitFailed { address, source },
                    other => other,
                })
            }
        }
    }

    /// Status of the in-flight commit, or of the last finished one.
    pub fn commit_status(&self) -> Option<CommitStatus> {
        self.device.last_commit().map(|operation| operation.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::mock::{MockBackend, WriteBehavior, SENSOR};
    use crate::config::SessionConfig;
    use crate::error::TransportError;
    use crate::supervisor::ConnectionSupervisor;
    use std::sync::Arc;
    use tokio::time::{sleep, Duration};

    async fn open(backend: &MockBackend) -> ParameterSession<MockBackend> {
        let supervisor = Arc::new(ConnectionSupervisor::new(
            backend.clone(),
            SessionConfig::default(),
        ));
        ParameterSession::open(supervisor, SENSOR).await.unwrap()
    }

    #[tokio::test]
    async fn test_commit_writes_single_byte() {
        let backend = MockBackend::with_sample_sensor();
        let session = open(&backend).await;
        let mut events = session.supervisor().subscribe_events();

        let operation = session.commit().await.unwrap();

        assert_eq!(operation.status, CommitStatus::Succeeded);
        assert_eq!(operation.target_address, SENSOR);
        assert_eq!(backend.written(), vec![(characteristics::COMMIT, vec![0x01])]);
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Committed { address: SENSOR }
        );
        assert!(!session.device().commit_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_retries_once_after_timeout() {
        let backend = MockBackend::with_sample_sensor();
        backend.script_writes(characteristics::COMMIT, [WriteBehavior::Hang]);
        let session = open(&backend).await;

        let operation = session.commit().await.unwrap();

        assert_eq!(operation.status, CommitStatus::Succeeded);
        assert_eq!(backend.discoveries(), 1);
        assert_eq!(backend.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_shows_retry_while_reconnecting() {
        let backend = MockBackend::with_sample_sensor();
        backend.script_writes(characteristics::COMMIT, [WriteBehavior::Hang]);
        backend.set_scan_duration(Duration::from_secs(5));
        let session = open(&backend).await;

        let first = session.clone();
        let in_flight = tokio::spawn(async move { first.commit().await });
        sleep(Duration::from_secs(6)).await;

        assert_eq!(
            session.commit_status(),
            Some(CommitStatus::RetryingAfterTimeout)
        );
        assert!(session.device().commit_in_flight());

        let operation = in_flight.await.unwrap().unwrap();
        assert_eq!(operation.status, CommitStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_fails_after_second_timeout() {
        let backend = MockBackend::with_sample_sensor();
        backend.script_writes(
            characteristics::COMMIT,
            [WriteBehavior::Hang, WriteBehavior::Hang, WriteBehavior::Ok],
        );
        let session = open(&backend).await;

        let err = session.commit().await.unwrap_err();

        assert!(matches!(
            err,
            Error::CommitFailed {
                source: TransportError::Timeout { .. },
                ..
            }
        ));
        assert!(matches!(session.commit_status(), Some(CommitStatus::Failed(_))));
        assert!(backend.written().is_empty());
        assert!(!session.device().commit_in_flight());
    }

    #[tokio::test]
    async fn test_hard_failure_is_not_retried() {
        let backend = MockBackend::with_sample_sensor();
        backend.script_writes(
            characteristics::COMMIT,
            [WriteBehavior::Fail("GATT error".into())],
        );
        let session = open(&backend).await;

        let err = session.commit().await.unwrap_err();

        assert_eq!(
            session.commit_status(),
            Some(CommitStatus::Failed(
                TransportError::Write {
                    uuid: characteristics::COMMIT,
                    message: "GATT error".into()
                }
                .to_string()
            ))
        );
        assert!(matches!(err, Error::CommitFailed { .. }));
        assert_eq!(backend.discoveries(), 0);
        assert_eq!(err.status_text(), "Commit failed");

        // the slot is free again
        session.commit().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_commit_is_rejected() {
        let backend = MockBackend::with_sample_sensor();
        backend.script_writes(characteristics::COMMIT, [WriteBehavior::Hang]);
        let session = open(&backend).await;

        let first = session.clone();
        let in_flight = tokio::spawn(async move { first.commit().await });
        tokio::task::yield_now().await;
        assert_eq!(session.commit_status(), Some(CommitStatus::Pending));

        assert_eq!(
            session.commit().await.unwrap_err(),
            Error::CommitInProgress(SENSOR)
        );

        let operation = in_flight.await.unwrap().unwrap();
        assert_eq!(operation.status, CommitStatus::Succeeded);
        assert!(!session.device().commit_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_to_vanished_device_reports_not_found() {
        let backend = MockBackend::with_sample_sensor();
        backend.script_writes(characteristics::COMMIT, [WriteBehavior::Hang]);
        let session = open(&backend).await;
        backend.stop_advertising();

        let err = session.commit().await.unwrap_err();

        assert_eq!(err, Error::DeviceNotPresent(SENSOR));
        assert_eq!(err.status_text(), "Sensor not found");
        assert!(matches!(session.commit_status(), Some(CommitStatus::Failed(_))));
    }

    #[tokio::test]
    async fn test_cancelled_commit_frees_slot() {
        let backend = MockBackend::with_sample_sensor();
        backend.script_writes(characteristics::COMMIT, [WriteBehavior::Hang]);
        let session = open(&backend).await;

        let first = session.clone();
        let in_flight = tokio::spawn(async move { first.commit().await });
        tokio::task::yield_now().await;
        in_flight.abort();
        let _ = in_flight.await;

        assert!(!session.device().commit_in_flight());
        assert!(matches!(session.commit_status(), Some(CommitStatus::Failed(_))));
    }
}
