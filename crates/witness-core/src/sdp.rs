//! Serial Download Protocol client for the i.MX6UL/ULL boot ROM.
//!
//! The ROM exposes a HID interface. Commands go out as report 1, data as
//! report 2; the ROM answers with report 3 (HAB status) and report 4
//! (command status).

use std::sync::{Mutex, TryLockError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::protocol::{
    D2H_RESPONSE_LAST, H2D_COMMAND, H2D_DATA, HID_TIMEOUT, ImxError, Ivt, OCRAM_STAGING_ADDR,
    SDP_CHUNK_SIZE, SdpCommand, SdpCommandError,
};
use crate::transport::{HidDeviceInfo, HidTransport, TransportError};

#[derive(Error, Debug)]
pub enum SdpError {
    #[error("Boot already in progress on {path}")]
    BootInProgress { path: String },

    #[error("Invalid boot image: {0}")]
    Imx(#[from] ImxError),

    #[error("Command encoding failed: {0}")]
    Command(#[from] SdpCommandError),

    #[error("{len} bytes at 0x{addr:08X} do not fit the 32-bit address space")]
    OutOfRange { addr: u32, len: usize },

    #[error("{step} failed: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: TransportError,
    },
}

impl SdpError {
    fn step(step: &'static str) -> impl FnOnce(TransportError) -> SdpError {
        move |source| SdpError::Step { step, source }
    }

    /// Byte count of a transfer of `len` bytes to `addr`, if every byte is
    /// addressable.
    fn checked_range(addr: u32, len: usize) -> Result<u32, SdpError> {
        let out_of_range = || SdpError::OutOfRange { addr, len };
        let count = u32::try_from(len).map_err(|_| out_of_range())?;
        if count > 0 {
            addr.checked_add(count - 1).ok_or_else(out_of_range)?;
        }
        Ok(count)
    }

    /// True if the operation stopped because its token was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            SdpError::Step {
                source: TransportError::Cancelled,
                ..
            }
        )
    }
}

/// A device in serial download mode.
pub struct SdpTarget {
    info: HidDeviceInfo,
    transport: Box<dyn HidTransport>,
    timeout: Duration,
    cancel: CancellationToken,
    boot_lock: Mutex<()>,
}

impl SdpTarget {
    pub fn new(info: HidDeviceInfo, transport: Box<dyn HidTransport>) -> Self {
        Self {
            info,
            transport,
            timeout: HID_TIMEOUT,
            cancel: CancellationToken::new(),
            boot_lock: Mutex::new(()),
        }
    }

    /// Override the response timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Stop chunked writes when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn info(&self) -> &HidDeviceInfo {
        &self.info
    }

    /// Send one report and, if `expected` is set, wait for a report with
    /// that ID. Reports with other IDs are discarded.
    pub fn send_command(
        &self,
        report_id: u8,
        payload: &[u8],
        expected: Option<u8>,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let mut report = Vec::with_capacity(1 + payload.len());
        report.push(report_id);
        report.extend_from_slice(payload);
        self.transport.write_report(&report)?;

        let Some(expected) = expected else {
            return Ok(None);
        };

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.timed_out());
            }
            match self.transport.read_report(remaining) {
                Ok(response) if response.first() == Some(&expected) => return Ok(Some(response)),
                Ok(response) => {
                    debug!(report_id = response.first().copied(), "Discarding report");
                }
                Err(TransportError::Timeout { .. }) => return Err(self.timed_out()),
                Err(e) => return Err(e),
            }
        }
    }

    fn timed_out(&self) -> TransportError {
        TransportError::Timeout {
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }

    fn write_file_command(&self, addr: u32, len: usize) -> Result<(), SdpError> {
        let count = SdpError::checked_range(addr, len)?;
        let cmd = SdpCommand::write_file(addr, count).to_bytes()?;
        self.send_command(H2D_COMMAND, &cmd, None)
            .map_err(SdpError::step("file write command"))?;
        Ok(())
    }

    /// Write `payload` to `addr` in 1024 byte data reports.
    ///
    /// Only the final report waits for the completion status. A transient
    /// write error is retried once by restarting the transfer at the failed
    /// chunk.
    #[instrument(skip(self, payload), fields(addr = %format!("0x{:08X}", addr), len = payload.len()))]
    pub fn write_chunked(&self, addr: u32, payload: &[u8]) -> Result<(), SdpError> {
        self.write_file_command(addr, payload.len())?;

        let chunks: Vec<&[u8]> = payload.chunks(SDP_CHUNK_SIZE).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(SdpError::Step {
                    step: "file write",
                    source: TransportError::Cancelled,
                });
            }

            let expected = (i == chunks.len() - 1).then_some(D2H_RESPONSE_LAST);
            match self.send_command(H2D_DATA, chunk, expected) {
                Ok(_) => {}
                Err(TransportError::Transient(e)) => {
                    let offset = i * SDP_CHUNK_SIZE;
                    let resume = u32::try_from(offset)
                        .ok()
                        .and_then(|offset| addr.checked_add(offset))
                        .ok_or(SdpError::OutOfRange {
                            addr,
                            len: payload.len(),
                        })?;
                    warn!(chunk = i, error = %e, "Transient write error, restarting transfer");
                    self.write_file_command(resume, payload.len() - offset)?;
                    self.send_command(H2D_DATA, chunk, expected)
                        .map_err(SdpError::step("file write"))?;
                }
                Err(e) => return Err(SdpError::step("file write")(e)),
            }
        }
        Ok(())
    }

    /// Load a DCD table into OCRAM and have the ROM execute it.
    pub fn dcd_write(&self, addr: u32, dcd: &[u8]) -> Result<(), SdpError> {
        let count = SdpError::checked_range(addr, dcd.len())?;
        let cmd = SdpCommand::dcd_write(addr, count).to_bytes()?;
        self.send_command(H2D_COMMAND, &cmd, None)
            .map_err(SdpError::step("DCD write command"))?;
        self.send_command(H2D_DATA, dcd, Some(D2H_RESPONSE_LAST))
            .map_err(SdpError::step("DCD write"))?;
        Ok(())
    }

    pub fn jump_address(&self, addr: u32) -> Result<(), SdpError> {
        let cmd = SdpCommand::jump_address(addr).to_bytes()?;
        self.send_command(H2D_COMMAND, &cmd, None)
            .map_err(SdpError::step("jump address"))?;
        Ok(())
    }

    /// Load an imx image and jump to it.
    #[instrument(skip(self, imx), fields(path = %self.info.path, len = imx.len()))]
    pub fn boot_image(&self, imx: &[u8]) -> Result<(), SdpError> {
        let _guard = match self.boot_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                return Err(SdpError::BootInProgress {
                    path: self.info.path.clone(),
                });
            }
        };
        if self.cancel.is_cancelled() {
            return Err(SdpError::Step {
                step: "boot",
                source: TransportError::Cancelled,
            });
        }

        info!(path = %self.info.path, "Attempting SDP boot");
        let ivt = Ivt::parse(imx)?;
        let dcd = ivt.dcd(imx)?;

        info!(addr = %format!("0x{:08X}", OCRAM_STAGING_ADDR), len = dcd.len(), "Loading DCD");
        self.dcd_write(OCRAM_STAGING_ADDR, dcd)?;

        info!(addr = %format!("0x{:08X}", ivt.self_addr), len = imx.len(), "Loading imx");
        self.write_chunked(ivt.self_addr, imx)?;

        info!(addr = %format!("0x{:08X}", ivt.self_addr), "Sending jump address");
        self.jump_address(ivt.self_addr)?;

        info!(path = %self.info.path, "Serial download complete");
        Ok(())
    }
}
