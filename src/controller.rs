/// Hand-off between a front-end thread and the transport runtime
///
/// Front ends never touch the BLE stack directly. They send a command to a
/// per-device worker running on the tokio runtime and wait for the reply,
/// either from async code or with the `blocking_*` methods from a plain UI
/// thread.
use bluer::Address;
use log::{debug, info};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::bluetooth::characteristics::DeviceAction;
use crate::bluetooth::transport::BleBackend;
use crate::error::Error;
use crate::models::{CommitOperation, DeviceReadings, ParameterView};
use crate::session::ParameterSession;
use crate::stream::SampleBuffer;

const COMMAND_QUEUE_DEPTH: usize = 32;

/// Work the worker runs concurrently, one task per request.
pub enum Request {
    ReadParameter {
        key: String,
        reply: oneshot::Sender<Result<u64, Error>>,
    },
    WriteParameter {
        key: String,
        label: String,
        reply: oneshot::Sender<Result<u64, Error>>,
    },
    Commit {
        reply: oneshot::Sender<Result<CommitOperation, Error>>,
    },
    Action {
        action: DeviceAction,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    ReadReadings {
        reply: oneshot::Sender<Result<DeviceReadings, Error>>,
    },
    StartStream {
        reply: oneshot::Sender<Result<SampleBuffer, Error>>,
    },
    Parameters {
        reply: oneshot::Sender<Vec<ParameterView>>,
    },
}

pub enum Command {
    Run(Request),
    /// Handled in order; stops the worker.
    Close { reply: oneshot::Sender<()> },
}

/// Front-end handle for one open device.
#[derive(Debug, Clone)]
pub struct DeviceController {
    address: Address,
    commands: mpsc::Sender<Command>,
}

impl DeviceController {
    /// Start the worker for `session` on `runtime`.
    ///
    /// Each command runs as its own task, so writes to different keys
    /// proceed concurrently. `Close` is handled in order and stops the worker.
    pub fn spawn<B: BleBackend>(
        session: ParameterSession<B>,
        runtime: &Handle,
    ) -> (Self, JoinHandle<()>) {
        let address = session.address();
        let (commands, mut rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);

        let worker = runtime.spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Run(request) => {
                        let session = session.clone();
                        tokio::spawn(async move { dispatch(session, request).await });
                    }
                    Command::Close { reply } => {
                        session.close();
                        let _ = reply.send(());
                        break;
                    }
                }
            }
            debug!("Controller for {} stopped", address);
        });

        info!("Controller for {} started", address);
        (DeviceController { address, commands }, worker)
    }

    pub fn address(&self) -> Address {
        self.address
    }

    async fn send<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, Error> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| Error::SessionClosed(self.address))?;
        response.await.map_err(|_| Error::SessionClosed(self.address))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, Error> {
        self.send(|reply| Command::Run(build(reply))).await
    }

    /// Must not be called from inside the runtime.
    fn blocking_request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, Error> {
        let (reply, response) = oneshot::channel();
        self.commands
            .blocking_send(Command::Run(build(reply)))
            .map_err(|_| Error::SessionClosed(self.address))?;
        response
            .blocking_recv()
            .map_err(|_| Error::SessionClosed(self.address))
    }

    pub async fn read_parameter(&self, key: &str) -> Result<u64, Error> {
        let key = key.to_string();
        self.request(|reply| Request::ReadParameter { key, reply })
            .await?
    }

    pub async fn write_parameter(&self, key: &str, label: &str) -> Result<u64, Error> {
        let (key, label) = (key.to_string(), label.to_string());
        self.request(|reply| Request::WriteParameter { key, label, reply })
            .await?
    }

    pub fn blocking_write_parameter(&self, key: &str, label: &str) -> Result<u64, Error> {
        let (key, label) = (key.to_string(), label.to_string());
        self.blocking_request(|reply| Request::WriteParameter { key, label, reply })?
    }

    pub async fn commit(&self) -> Result<CommitOperation, Error> {
        self.request(|reply| Request::Commit { reply }).await?
    }

    pub fn blocking_commit(&self) -> Result<CommitOperation, Error> {
        self.blocking_request(|reply| Request::Commit { reply })?
    }

    pub async fn send_action(&self, action: DeviceAction) -> Result<(), Error> {
        self.request(|reply| Request::Action { action, reply })
            .await?
    }

    pub async fn read_readings(&self) -> Result<DeviceReadings, Error> {
        self.request(|reply| Request::ReadReadings { reply }).await?
    }

    pub async fn start_stream(&self) -> Result<SampleBuffer, Error> {
        self.request(|reply| Request::StartStream { reply }).await?
    }

    pub async fn parameters(&self) -> Result<Vec<ParameterView>, Error> {
        self.request(|reply| Request::Parameters { reply }).await
    }

    pub fn blocking_parameters(&self) -> Result<Vec<ParameterView>, Error> {
        self.blocking_request(|reply| Request::Parameters { reply })
    }

    pub async fn close(&self) -> Result<(), Error> {
        self.send(|reply| Command::Close { reply }).await
    }
}

async fn dispatch<B: BleBackend>(session: ParameterSession<B>, request: Request) {
    // A dropped receiver means the front end stopped waiting
    match request {
        Request::ReadParameter { key, reply } => {
            let _ = reply.send(session.read_parameter(&key).await);
        }
        Request::WriteParameter { key, label, reply } => {
            let _ = reply.send(session.write_parameter(&key, &label).await);
        }
        Request::Commit { reply } => {
            let _ = reply.send(session.commit().await);
        }
        Request::Action { action, reply } => {
            let _ = reply.send(session.send_action(action).await);
        }
        Request::ReadReadings { reply } => {
            let _ = reply.send(session.read_readings().await);
        }
        Request::StartStream { reply } => {
            let _ = reply.send(session.start_stream().await);
        }
        Request::Parameters { reply } => {
            let _ = reply.send(session.parameters());
        }
    }
}
