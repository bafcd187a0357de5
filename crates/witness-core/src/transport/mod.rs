//! Transport layer - HID device enumeration and report I/O.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{MockEnumerator, MockFailure, MockHidTransport};
pub use self::nusb::{NusbEnumerator, NusbHidTransport};
pub use traits::{HidDeviceInfo, HidTransport, TransportError, UsbEnumerator};
