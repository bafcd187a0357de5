//! Mock HID transport for testing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{HidDeviceInfo, HidTransport, TransportError, UsbEnumerator};

type Responder = Arc<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync>;

/// Failure injected into a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// The macOS HID contention error.
    Transient,
    /// Any other write error.
    Fatal,
}

/// Mock transport for unit testing protocol logic.
///
/// Clones share state, so a test can keep a handle after boxing one.
#[derive(Clone)]
pub struct MockHidTransport {
    /// Queued input reports returned on read.
    reports: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Captured successful writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Write attempt number -> injected failure.
    failures: Arc<Mutex<HashMap<usize, MockFailure>>>,
    attempts: Arc<Mutex<usize>>,
    /// Produces input reports in reaction to a write.
    responder: Option<Responder>,
    connected: Arc<Mutex<bool>>,
    vid: u16,
    pid: u16,
    path: String,
}

impl MockHidTransport {
    pub fn new() -> Self {
        Self {
            reports: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(Mutex::new(HashMap::new())),
            attempts: Arc::new(Mutex::new(0)),
            responder: None,
            connected: Arc::new(Mutex::new(true)),
            vid: crate::protocol::FREESCALE_VENDOR_ID,
            pid: crate::protocol::IMX6ULL_SDP_PID,
            path: "mock:1".to_string(),
        }
    }

    /// Set VID/PID and path.
    pub fn with_ids(mut self, vid: u16, pid: u16, path: &str) -> Self {
        self.vid = vid;
        self.pid = pid;
        self.path = path.to_string();
        self
    }

    /// React to every successful write with zero or more input reports.
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(responder));
        self
    }

    /// Queue an input report to be returned on next read.
    pub fn queue_report(&self, report: &[u8]) {
        self.reports.lock().unwrap().push_back(report.to_vec());
    }

    /// Fail the `attempt`-th write (zero based, counting failed attempts).
    pub fn fail_write(&self, attempt: usize, failure: MockFailure) {
        self.failures.lock().unwrap().insert(attempt, failure);
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        *self.connected.lock().unwrap() = true;
    }

    pub fn info(&self) -> HidDeviceInfo {
        HidDeviceInfo {
            vendor_id: self.vid,
            product_id: self.pid,
            interface: 0,
            path: self.path.clone(),
            product: None,
        }
    }
}

impl Default for MockHidTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HidTransport for MockHidTransport {
    fn write_report(&self, report: &[u8]) -> Result<usize, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }

        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = *attempts;
            *attempts += 1;
            n
        };
        match self.failures.lock().unwrap().remove(&attempt) {
            Some(MockFailure::Transient) => {
                return Err(TransportError::Transient("hid: general error".to_string()));
            }
            Some(MockFailure::Fatal) => {
                return Err(TransportError::WriteFailed("pipe error".to_string()));
            }
            None => {}
        }

        self.write_log.lock().unwrap().push(report.to_vec());
        if let Some(responder) = &self.responder {
            let replies = responder(report);
            self.reports.lock().unwrap().extend(replies);
        }
        Ok(report.len())
    }

    fn read_report(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        self.reports
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })
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

/// Mock enumerator serving a changeable set of mock devices.
#[derive(Clone, Default)]
pub struct MockEnumerator {
    devices: Arc<Mutex<Vec<(MockHidTransport, Option<u16>)>>>,
}

impl MockEnumerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device with an optional usage page.
    pub fn attach(&self, device: MockHidTransport, usage_page: Option<u16>) {
        self.devices.lock().unwrap().push((device, usage_page));
    }

    /// Detach every device.
    pub fn detach_all(&self) {
        self.devices.lock().unwrap().clear();
    }
}

impl UsbEnumerator for MockEnumerator {
    fn hid_devices(&self) -> Result<Vec<HidDeviceInfo>, TransportError> {
        Ok(self.devices.lock().unwrap().iter().map(|(d, _)| d.info()).collect())
    }

    fn usage_page(&self, info: &HidDeviceInfo) -> Result<Option<u16>, TransportError> {
        Ok(self
            .devices
            .lock()
            .unwrap()
            .iter()
            .find(|(d, _)| d.path == info.path)
            .and_then(|(_, page)| *page))
    }

    fn open(&self, info: &HidDeviceInfo) -> Result<Box<dyn HidTransport>, TransportError> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .find(|(d, _)| d.path == info.path)
            .map(|(d, _)| Box::new(d.clone()) as Box<dyn HidTransport>)
            .ok_or(TransportError::DeviceNotFound {
                vid: info.vendor_id,
                pid: info.product_id,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_report_queue() {
        let mock = MockHidTransport::new();
        mock.queue_report(&[3, 0x12, 0x34, 0x34, 0x12]);
        mock.queue_report(&[4, 0x88, 0x88, 0x88, 0x88]);

        assert_eq!(mock.read_report(Duration::from_millis(10)).unwrap()[0], 3);
        assert_eq!(mock.read_report(Duration::from_millis(10)).unwrap()[0], 4);
        assert!(matches!(
            mock.read_report(Duration::from_millis(10)),
            Err(TransportError::Timeout { timeout_ms: 10 })
        ));
    }

    #[test]
    fn test_mock_write_capture_and_failures() {
        let mock = MockHidTransport::new();
        mock.fail_write(1, MockFailure::Transient);
        mock.write_report(b"\x01first").unwrap();
        assert!(matches!(
            mock.write_report(b"\x02second"),
            Err(TransportError::Transient(_))
        ));
        mock.write_report(b"\x02third").unwrap();

        let writes = mock.get_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1], b"\x02third");
    }

    #[test]
    fn test_mock_responder_and_disconnect() {
        let mock = MockHidTransport::new().with_responder(|r| vec![vec![r[0] + 2]]);
        mock.write_report(&[1, 0]).unwrap();
        assert_eq!(mock.read_report(Duration::ZERO).unwrap(), vec![3]);

        mock.disconnect();
        assert!(matches!(mock.write_report(&[1]), Err(TransportError::Disconnected)));
        mock.reconnect();
        assert!(mock.write_report(&[1]).is_ok());
    }

    #[test]
    fn test_mock_enumerator() {
        let enumerator = MockEnumerator::new();
        assert!(enumerator.hid_devices().unwrap().is_empty());

        let dev = MockHidTransport::new().with_ids(0x1209, 0x2702, "mock:op");
        enumerator.attach(dev, Some(0xF1D0));
        let infos = enumerator.hid_devices().unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(enumerator.usage_page(&infos[0]).unwrap(), Some(0xF1D0));
        assert_eq!(enumerator.open(&infos[0]).unwrap().path(), "mock:op");

        enumerator.detach_all();
        assert!(enumerator.open(&infos[0]).is_err());
    }
}
