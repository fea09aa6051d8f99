pub mod bluetooth;
pub mod commit;
pub mod config;
pub mod controller;
pub mod error;
pub mod models;
pub mod registry;
pub mod session;
pub mod stream;
pub mod supervisor;
pub mod utils;

pub use bluetooth::{BleBackend, BluerBackend, DeviceAction, Transport};
pub use config::SessionConfig;
pub use controller::DeviceController;
pub use error::{Error, RegistryError, TransportError};
pub use models::{
    AccelerationSample, CommitOperation, CommitStatus, ConnectionState, DeviceReadings,
    DiscoveredDevice, ParameterStatus, ParameterView, SessionEvent,
};
pub use registry::{lookup, ParameterDef, PARAMETERS};
pub use session::{DeviceSession, ParameterSession};
pub use stream::SampleBuffer;
pub use supervisor::ConnectionSupervisor;
