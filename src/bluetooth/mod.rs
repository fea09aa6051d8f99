pub mod characteristics;
#[cfg(test)]
pub mod mock;
pub mod scanner;
pub mod transport;

pub use characteristics::DeviceAction;
pub use transport::{BleBackend, BluerBackend, BluerTransport, NotificationStream, Transport};
