//! HID transport layer abstraction.
//!
//! Defines the `HidTransport` trait for report-level HID communication and
//! the `UsbEnumerator` trait for finding HID devices, allowing different
//! implementations (nusb, mock, etc.).

use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint not found: type={ep_type}, direction={direction}")]
    EndpointNotFound { ep_type: String, direction: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Known transient HID error; the write may be retried once.
    #[error("Transient write error: {0}")]
    Transient(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract HID transport interface.
///
/// Reports carry their report ID in the first byte. ID 0 denotes a device
/// without numbered reports; implementations strip it before sending.
pub trait HidTransport: Send + Sync {
    /// Write one output report.
    fn write_report(&self, report: &[u8]) -> Result<usize, TransportError>;

    /// Wait up to `timeout` for the next input report.
    fn read_report(&self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Get the current VID.
    fn vendor_id(&self) -> u16;

    /// Get the current PID.
    fn product_id(&self) -> u16;

    /// Platform path identifying the device.
    fn path(&self) -> String;
}

/// A HID interface found during enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidDeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface: u8,
    pub path: String,
    pub product: Option<String>,
}

impl fmt::Display for HidDeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X} at {}", self.vendor_id, self.product_id, self.path)?;
        if let Some(product) = &self.product {
            write!(f, " ({product})")?;
        }
        Ok(())
    }
}

/// Finds and opens HID devices.
pub trait UsbEnumerator: Send + Sync {
    /// List HID interfaces currently attached.
    fn hid_devices(&self) -> Result<Vec<HidDeviceInfo>, TransportError>;

    /// Usage page from the interface's report descriptor, if it has one.
    fn usage_page(&self, info: &HidDeviceInfo) -> Result<Option<u16>, TransportError>;

    /// Open the interface for report I/O.
    fn open(&self, info: &HidDeviceInfo) -> Result<Box<dyn HidTransport>, TransportError>;
}
