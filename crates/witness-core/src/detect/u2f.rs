//! Operational persona: the witness firmware's U2FHID interface.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{DetectError, POLL_INTERVAL, PersonaFilter, detect_hid, wait_until};
use crate::protocol::u2fhid::{
    BROADCAST_CID, CMD_ARMORY_HAB, CMD_ARMORY_INF, CMD_ERROR, CMD_INIT, INIT_NONCE_SIZE,
    encode_message,
};
use crate::protocol::{CommandResponse, DeviceStatus, FrameError, MessageAssembler, StatusError};
use crate::transport::{HidDeviceInfo, HidTransport, TransportError, UsbEnumerator};

#[derive(Error, Debug)]
pub enum U2fError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("Invalid response: {0}")]
    Status(#[from] StatusError),

    #[error("Device reported U2FHID error 0x{0:02X}")]
    Device(u8),

    #[error("Unexpected response command 0x{actual:02X} (sent 0x{sent:02X})")]
    UnexpectedCommand { sent: u8, actual: u8 },

    #[error("Short INIT response: {0} bytes")]
    ShortInit(usize),

    #[error("Command failed with code {code}: {message}")]
    Command { code: u64, message: String },

    #[error("Command cancelled")]
    Cancelled,
}

/// An open U2FHID channel to the operational firmware.
pub struct U2fDevice {
    transport: Box<dyn HidTransport>,
    cid: u32,
    cancel: CancellationToken,
}

impl std::fmt::Debug for U2fDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("U2fDevice")
            .field("path", &self.transport.path())
            .field("cid", &format!("0x{:08X}", self.cid))
            .finish()
    }
}

impl U2fDevice {
    /// Allocate a channel on the device.
    #[instrument(skip_all, fields(path = %transport.path()))]
    pub fn open(transport: Box<dyn HidTransport>, cancel: CancellationToken) -> Result<Self, U2fError> {
        let mut device = Self {
            transport,
            cid: BROADCAST_CID,
            cancel,
        };

        let nonce = init_nonce();
        device.send(CMD_INIT, &nonce)?;
        // other hosts may be initializing channels too
        loop {
            let payload = device.receive(CMD_INIT)?;
            if payload.len() < INIT_NONCE_SIZE + 4 {
                return Err(U2fError::ShortInit(payload.len()));
            }
            if payload[..INIT_NONCE_SIZE] == nonce {
                let cid = &payload[INIT_NONCE_SIZE..INIT_NONCE_SIZE + 4];
                device.cid = u32::from_be_bytes([cid[0], cid[1], cid[2], cid[3]]);
                break;
            }
            debug!("Ignoring INIT response for another nonce");
        }

        debug!(cid = %format!("0x{:08X}", device.cid), "U2FHID channel allocated");
        Ok(device)
    }

    pub fn path(&self) -> String {
        self.transport.path()
    }

    fn send(&self, cmd: u8, payload: &[u8]) -> Result<(), U2fError> {
        for packet in encode_message(self.cid, cmd, payload)? {
            let mut report = Vec::with_capacity(1 + packet.len());
            // unnumbered report
            report.push(0);
            report.extend_from_slice(&packet);
            self.transport.write_report(&report)?;
        }
        Ok(())
    }

    fn receive(&self, sent: u8) -> Result<Vec<u8>, U2fError> {
        let mut assembler = MessageAssembler::new(self.cid);
        loop {
            if self.cancel.is_cancelled() {
                return Err(U2fError::Cancelled);
            }
            let report = match self.transport.read_report(POLL_INTERVAL) {
                Ok(report) => report,
                Err(TransportError::Timeout { .. }) => continue,
                Err(e) => return Err(e.into()),
            };
            let Some(message) = assembler.push(&report)? else {
                continue;
            };
            return match message.cmd {
                CMD_ERROR => Err(U2fError::Device(message.payload.first().copied().unwrap_or(0))),
                cmd if cmd == sent => Ok(message.payload),
                actual => Err(U2fError::UnexpectedCommand { sent, actual }),
            };
        }
    }

    /// Send a command and wait for its response. Waits until cancelled.
    pub fn command(&mut self, cmd: u8, payload: &[u8]) -> Result<Vec<u8>, U2fError> {
        self.send(cmd, payload)?;
        self.receive(cmd)
    }

    /// Query the device status.
    pub fn status(&mut self) -> Result<DeviceStatus, U2fError> {
        let buf = self.command(CMD_ARMORY_INF, &[])?;
        Ok(DeviceStatus::decode(&buf)?)
    }

    /// Irreversibly enable HAB secure boot.
    pub fn activate_hab(&mut self) -> Result<(), U2fError> {
        let buf = self.command(CMD_ARMORY_HAB, &[])?;
        let response = CommandResponse::decode(&buf)?;
        if response.error != 0 {
            return Err(U2fError::Command {
                code: response.error,
                message: String::from_utf8_lossy(&response.payload).into_owned(),
            });
        }
        Ok(())
    }
}

fn init_nonce() -> [u8; INIT_NONCE_SIZE] {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    (nanos ^ std::process::id() as u64).to_be_bytes()
}

/// First operational device present, if any.
pub fn detect_u2f(
    enumerator: &dyn UsbEnumerator,
    filter: &PersonaFilter,
) -> Result<Option<HidDeviceInfo>, DetectError> {
    Ok(detect_hid(enumerator, filter)?.into_iter().next())
}

/// Wait for the operational firmware and open a channel to it.
pub fn wait_for_operational(
    enumerator: &dyn UsbEnumerator,
    filter: &PersonaFilter,
    poll: Duration,
    cancel: &CancellationToken,
) -> Result<U2fDevice, DetectError> {
    info!("Waiting for operational device");
    let info = wait_until(poll, cancel, || match detect_u2f(enumerator, filter) {
        Ok(found) => Ok(found),
        Err(e) => {
            warn!(error = %e, "Failed to detect devices");
            Ok(None)
        }
    })?;

    let transport = enumerator.open(&info)?;
    match U2fDevice::open(transport, cancel.clone()) {
        Ok(device) => Ok(device),
        Err(U2fError::Cancelled) => Err(DetectError::Cancelled),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::u2fhid::HID_REPORT_SIZE;
    use crate::transport::{MockEnumerator, MockHidTransport};

    pub(crate) const DEVICE_CID: u32 = 0x1122_3344;

    /// Simulated operational firmware answering INIT, INF and HAB.
    pub(crate) fn firmware(status: DeviceStatus, hab_error: u64) -> MockHidTransport {
        MockHidTransport::new()
            .with_ids(0x1209, 0x2702, "3:7")
            .with_responder(move |report| {
                // skip the report ID byte
                let packet = &report[1..];
                assert_eq!(packet.len(), HID_REPORT_SIZE);
                let cid = u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]);
                let cmd = packet[4] & 0x7F;
                let len = u16::from_be_bytes([packet[5], packet[6]]) as usize;
                let payload = &packet[7..7 + len];

                let (reply_cid, reply) = match cmd {
                    CMD_INIT => {
                        let mut reply = payload.to_vec();
                        reply.extend_from_slice(&DEVICE_CID.to_be_bytes());
                        reply.extend_from_slice(&[2, 1, 0, 0, 0]);
                        (BROADCAST_CID, reply)
                    }
                    CMD_ARMORY_INF => (cid, status.encode().unwrap()),
                    CMD_ARMORY_HAB => {
                        let response = CommandResponse {
                            error: hab_error,
                            payload: if hab_error == 0 { Vec::new() } else { b"fuse write failed".to_vec() },
                        };
                        (cid, response.encode().unwrap())
                    }
                    _ => (cid, vec![0x01]),
                };
                let reply_cmd = if matches!(cmd, CMD_INIT | CMD_ARMORY_INF | CMD_ARMORY_HAB) {
                    cmd
                } else {
                    CMD_ERROR
                };
                encode_message(reply_cid, reply_cmd, &reply)
                    .unwrap()
                    .iter()
                    .map(|r| r.to_vec())
                    .collect()
            })
    }

    fn sample_status() -> DeviceStatus {
        DeviceStatus {
            serial: "0123456789ABCDEF".into(),
            hab: false,
            revision: "v1.2.3".into(),
            version: "0.4.1".into(),
            runtime: "go1.22".into(),
            identity: "ArmoredWitness-ab12+77e9ca2f+AQD0bG1cM8qTAXrwGmkNr36dvfqeHnxQsJQrLM7zVLS0".into(),
            ip: "10.0.0.2".into(),
            srk_hash: "b8ba457320663bf006accd3c57e06720e63b21ce5351cb91b4650690bb08d85a".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_open_allocates_channel() {
        let mock = firmware(sample_status(), 0);
        let device = U2fDevice::open(Box::new(mock.clone()), CancellationToken::new()).unwrap();
        assert_eq!(device.cid, DEVICE_CID);

        let init = &mock.get_writes()[0];
        assert_eq!(init[0], 0);
        assert_eq!(&init[1..5], &BROADCAST_CID.to_be_bytes());
        assert_eq!(init[5], 0x80 | CMD_INIT);
    }

    #[test]
    fn test_status_multi_packet() {
        let status = sample_status();
        // large enough to need continuation packets
        assert!(status.encode().unwrap().len() > 57);

        let mut device =
            U2fDevice::open(Box::new(firmware(status.clone(), 0)), CancellationToken::new()).unwrap();
        assert_eq!(device.status().unwrap(), status);
    }

    #[test]
    fn test_activate_hab() {
        let mut ok = U2fDevice::open(Box::new(firmware(sample_status(), 0)), CancellationToken::new()).unwrap();
        ok.activate_hab().unwrap();

        let mut failing =
            U2fDevice::open(Box::new(firmware(sample_status(), 7)), CancellationToken::new()).unwrap();
        match failing.activate_hab() {
            Err(U2fError::Command { code, message }) => {
                assert_eq!(code, 7);
                assert_eq!(message, "fuse write failed");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_device_error_response() {
        let mut device =
            U2fDevice::open(Box::new(firmware(sample_status(), 0)), CancellationToken::new()).unwrap();
        assert!(matches!(device.command(0x50, &[]), Err(U2fError::Device(0x01))));
    }

    #[test]
    fn test_command_cancelled() {
        let cancel = CancellationToken::new();
        let mut device = U2fDevice::open(Box::new(firmware(sample_status(), 0)), cancel.clone()).unwrap();
        let silent = MockHidTransport::new();
        device.transport = Box::new(silent);
        cancel.cancel();
        assert!(matches!(device.status(), Err(U2fError::Cancelled)));
    }

    #[test]
    fn test_wait_for_operational() {
        let enumerator = MockEnumerator::new();
        enumerator.attach(firmware(sample_status(), 0), Some(0xF1D0));

        let mut device = wait_for_operational(
            &enumerator,
            &PersonaFilter::operational(),
            Duration::from_millis(5),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(device.path(), "3:7");
        assert_eq!(device.status().unwrap().serial, "0123456789ABCDEF");
    }
}
