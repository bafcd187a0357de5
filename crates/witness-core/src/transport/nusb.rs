//! nusb-based HID transport implementation.
//!
//! Input reports arrive on the interrupt IN endpoint and are drained by a
//! reader thread into a channel, independently of writes. Output reports use
//! the interrupt OUT endpoint when the interface has one (the operational
//! firmware) and a class SET_REPORT control transfer otherwise (the boot ROM).

use nusb::descriptors::TransferType;
use nusb::io::{EndpointRead, EndpointWrite};
use nusb::transfer::{ControlIn, ControlOut, ControlType, Direction, In, Interrupt, Out, Recipient, TransferError};
use nusb::{Interface, MaybeFuture, list_devices};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::traits::{HidDeviceInfo, HidTransport, TransportError, UsbEnumerator};
use crate::protocol::u2fhid::report_usage_page;

const USB_CLASS_HID: u8 = 0x03;
const HID_SET_REPORT: u8 = 0x09;
const HID_REPORT_TYPE_OUTPUT: u16 = 0x02;
const GET_DESCRIPTOR: u8 = 0x06;
const HID_REPORT_DESCRIPTOR: u16 = 0x22;

/// Largest input report either persona sends (SDP report 4: ID + 1024).
const MAX_INPUT_REPORT: usize = 1 + 1024;
const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);
/// How often the reader thread checks for shutdown.
const READER_POLL: Duration = Duration::from_millis(100);

type InboundReport = Result<Vec<u8>, TransportError>;

/// nusb-based HID transport.
pub struct NusbHidTransport {
    interface: Interface,
    interface_number: u8,
    inbound: Mutex<Receiver<InboundReport>>,
    writer: Option<Mutex<EndpointWrite<Interrupt>>>,
    stop: Arc<AtomicBool>,
    reader_thread: Option<JoinHandle<()>>,
    vid: u16,
    pid: u16,
    path: String,
}

impl NusbHidTransport {
    #[instrument(level = "info", fields(device = %info))]
    pub fn open(info: &HidDeviceInfo) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| device_path(d) == info.path)
            .ok_or(TransportError::DeviceNotFound {
                vid: info.vendor_id,
                pid: info.product_id,
            })?;

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let interface = device
            .detach_and_claim_interface(info.interface)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: info.interface,
                message: e.to_string(),
            })?;

        // Find INTERRUPT endpoints
        let mut in_endpoint: u8 = 0;
        let mut out_endpoint: u8 = 0;

        for config in device.configurations() {
            for iface in config.interfaces() {
                if iface.interface_number() == info.interface {
                    for alt in iface.alt_settings() {
                        for ep in alt.endpoints() {
                            if ep.transfer_type() == TransferType::Interrupt {
                                if ep.direction() == Direction::In {
                                    in_endpoint = ep.address();
                                } else {
                                    out_endpoint = ep.address();
                                }
                            }
                        }
                    }
                }
            }
        }

        if in_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Interrupt".into(),
                direction: "In".into(),
            });
        }

        let ep_in = interface
            .endpoint::<Interrupt, In>(in_endpoint)
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        // IN transfers must be a multiple of the packet size
        let packet = ep_in.max_packet_size().max(1);
        let reader = ep_in.reader(MAX_INPUT_REPORT.div_ceil(packet) * packet);
        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let reader_thread = {
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name(format!("hid-reader-{}", info.path))
                .spawn(move || read_loop(reader, tx, stop))?
        };

        let writer = if out_endpoint != 0 {
            let ep_out = interface
                .endpoint::<Interrupt, Out>(out_endpoint)
                .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
            let packet = ep_out.max_packet_size().max(1);
            Some(Mutex::new(ep_out.writer(packet)))
        } else {
            None
        };

        info!(
            vendor_id = %format!("{:04X}", info.vendor_id),
            product_id = %format!("{:04X}", info.product_id),
            in_ep = %format!("0x{:02X}", in_endpoint),
            out_ep = %format!("0x{:02X}", out_endpoint),
            "HID device opened"
        );

        Ok(Self {
            interface,
            interface_number: info.interface,
            inbound: Mutex::new(rx),
            writer,
            stop,
            reader_thread: Some(reader_thread),
            vid: info.vendor_id,
            pid: info.product_id,
            path: info.path.clone(),
        })
    }

    fn set_report(&self, report: &[u8]) -> Result<(), TransportError> {
        let report_id = report.first().copied().unwrap_or(0);
        // unnumbered reports go out without the ID byte
        let data = if report_id == 0 { report.get(1..).unwrap_or(&[]) } else { report };
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: HID_SET_REPORT,
                    value: (HID_REPORT_TYPE_OUTPUT << 8) | report_id as u16,
                    index: self.interface_number as u16,
                    data,
                },
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(classify_transfer_error)
    }
}

impl HidTransport for NusbHidTransport {
    #[instrument(skip(self, report), fields(len = report.len()))]
    fn write_report(&self, report: &[u8]) -> Result<usize, TransportError> {
        let Some(writer) = &self.writer else {
            self.set_report(report)?;
            debug!(bytes_written = report.len(), "SET_REPORT complete");
            return Ok(report.len());
        };

        let data = match report.split_first() {
            Some((0, rest)) => rest,
            _ => report,
        };
        let mut writer = writer
            .lock()
            .map_err(|_| TransportError::WriteFailed("writer poisoned".into()))?;
        writer.write_all(data).map_err(classify_write_error)?;
        writer.flush().map_err(classify_write_error)?;

        debug!(bytes_written = data.len(), "Write complete");
        Ok(report.len())
    }

    #[instrument(skip(self))]
    fn read_report(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let inbound = self
            .inbound
            .lock()
            .map_err(|_| TransportError::ReadFailed("reader poisoned".into()))?;
        let report = match inbound.recv_timeout(timeout) {
            Ok(report) => report?,
            Err(RecvTimeoutError::Timeout) => {
                return Err(TransportError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Disconnected),
        };

        debug!(bytes_read = report.len(), "Read complete");
        Ok(report)
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }

    fn path(&self) -> String {
        self.path.clone()
    }
}

impl Drop for NusbHidTransport {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Drain input reports until shutdown or a fatal read error.
fn read_loop(
    mut reader: EndpointRead<Interrupt>,
    tx: mpsc::Sender<InboundReport>,
    stop: Arc<AtomicBool>,
) {
    reader.set_read_timeout(READER_POLL);
    let mut buf = vec![0u8; MAX_INPUT_REPORT];
    while !stop.load(Ordering::Relaxed) {
        let report = match reader.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => Ok(buf[..n].to_vec()),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => {
                let fatal = match e.kind() {
                    io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe => {
                        TransportError::Disconnected
                    }
                    _ => TransportError::ReadFailed(e.to_string()),
                };
                let _ = tx.send(Err(fatal));
                return;
            }
        };
        if tx.send(report).is_err() {
            return;
        }
    }
}

/// `kIOReturnError`, what IOKit reports when another process holds the HID
/// interface on macOS.
const KIO_RETURN_ERROR: u32 = 0xE000_02BC;

/// Only macOS access contention is worth retrying.
fn classify_transfer_error(e: TransferError) -> TransportError {
    match e {
        TransferError::Disconnected => TransportError::Disconnected,
        TransferError::Unknown(code) if cfg!(target_os = "macos") && code == KIO_RETURN_ERROR => {
            warn!(error = %e, "Transient HID write error");
            TransportError::Transient(e.to_string())
        }
        other => TransportError::WriteFailed(other.to_string()),
    }
}

fn classify_write_error(e: io::Error) -> TransportError {
    match e.get_ref().and_then(|inner| inner.downcast_ref::<TransferError>()) {
        Some(transfer) => classify_transfer_error(*transfer),
        None if matches!(e.kind(), io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe) => {
            TransportError::Disconnected
        }
        None => TransportError::WriteFailed(e.to_string()),
    }
}

fn device_path(d: &nusb::DeviceInfo) -> String {
    format!("{}:{}", d.bus_id(), d.device_address())
}

/// Enumerates HID interfaces through nusb.
#[derive(Debug, Default, Clone, Copy)]
pub struct NusbEnumerator;

impl NusbEnumerator {
    pub fn new() -> Self {
        Self
    }
}

impl UsbEnumerator for NusbEnumerator {
    fn hid_devices(&self) -> Result<Vec<HidDeviceInfo>, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let mut found = Vec::new();
        for d in devices {
            for iface in d.interfaces() {
                if iface.class() == USB_CLASS_HID {
                    found.push(HidDeviceInfo {
                        vendor_id: d.vendor_id(),
                        product_id: d.product_id(),
                        interface: iface.interface_number(),
                        path: device_path(&d),
                        product: d.product_string().map(str::to_string),
                    });
                }
            }
        }
        Ok(found)
    }

    fn usage_page(&self, info: &HidDeviceInfo) -> Result<Option<u16>, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| device_path(d) == info.path)
            .ok_or(TransportError::DeviceNotFound {
                vid: info.vendor_id,
                pid: info.product_id,
            })?;
        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let descriptor = device
            .control_in(
                ControlIn {
                    control_type: ControlType::Standard,
                    recipient: Recipient::Interface,
                    request: GET_DESCRIPTOR,
                    value: HID_REPORT_DESCRIPTOR << 8,
                    index: info.interface as u16,
                    length: 512,
                },
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        Ok(report_usage_page(&descriptor))
    }

    fn open(&self, info: &HidDeviceInfo) -> Result<Box<dyn HidTransport>, TransportError> {
        Ok(Box::new(NusbHidTransport::open(info)?))
    }
}
