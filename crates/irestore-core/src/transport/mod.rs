//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{MockConnector, MockOp, MockTransport};
pub use nusb::{NusbConnector, NusbTransport};
pub use traits::{DeviceConnector, DeviceFilter, TransportError, UsbTransport};
