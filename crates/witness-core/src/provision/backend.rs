//! Device access used by the provisioning and verification flows.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::config::DeviceConfig;
use crate::detect::{U2fDevice, wait_for_block_device, wait_for_operational, wait_for_recovery};
use crate::flash::{FlashJob, MmcFlasher};
use crate::protocol::DeviceStatus;
use crate::transport::{NusbEnumerator, UsbEnumerator};

/// The operational firmware, reachable over U2FHID.
pub trait OperationalDevice: Send {
    fn path(&self) -> String;
    fn status(&mut self) -> Result<DeviceStatus>;
    /// Irreversibly enable HAB secure boot.
    fn activate_hab(&mut self) -> Result<()>;
}

impl OperationalDevice for U2fDevice {
    fn path(&self) -> String {
        U2fDevice::path(self)
    }

    fn status(&mut self) -> Result<DeviceStatus> {
        Ok(U2fDevice::status(self)?)
    }

    fn activate_hab(&mut self) -> Result<()> {
        Ok(U2fDevice::activate_hab(self)?)
    }
}

/// Everything the orchestrator does to a device, by persona.
pub trait DeviceBackend {
    /// Wait for a device in serial download mode, boot `image` on it and
    /// return the block device the recovery firmware exposes.
    fn boot_recovery(&mut self, image: &[u8], cancel: &CancellationToken) -> Result<PathBuf>;

    /// Write `jobs` in order to the block device.
    fn flash(&mut self, device: &Path, jobs: &[FlashJob]) -> Result<()>;

    /// Zero a block range, reporting `(done, total)` blocks.
    fn wipe(
        &mut self,
        device: &Path,
        start_block: u64,
        blocks: u64,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<()>;

    /// Read `len` bytes at `offset` from the block device.
    fn read_at(&mut self, device: &Path, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Wait for the operational firmware and open it.
    fn wait_for_operational(&mut self, cancel: &CancellationToken) -> Result<Box<dyn OperationalDevice>>;
}

/// Read `len` bytes at `offset` from a block device or image file.
///
/// Offsets and lengths usually come from config blocks on the device, so
/// the range is checked against the device size before anything is
/// allocated.
pub fn read_block_device(device: &Path, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut file = File::open(device).with_context(|| format!("Failed to open {}", device.display()))?;
    let device_len = file.seek(SeekFrom::End(0))?;
    let end = offset.checked_add(len as u64);
    if end.is_none_or(|end| end > device_len) {
        bail!(
            "Read of {len} bytes at 0x{offset:X} is past the end of {} ({device_len} bytes)",
            device.display()
        );
    }
    file.seek(SeekFrom::Start(offset))?;

    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .with_context(|| format!("Cannot allocate {len} bytes for {}", device.display()))?;
    file.take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        bail!(
            "Short read at 0x{offset:X} from {}: {} of {len} bytes",
            device.display(),
            buf.len()
        );
    }
    Ok(buf)
}

/// Real USB devices and host block devices.
pub struct UsbBackend<E: UsbEnumerator = NusbEnumerator> {
    enumerator: E,
    device: DeviceConfig,
    flasher: MmcFlasher,
}

impl UsbBackend<NusbEnumerator> {
    pub fn new(device: DeviceConfig) -> Self {
        Self::with_enumerator(NusbEnumerator::new(), device)
    }
}

impl<E: UsbEnumerator> UsbBackend<E> {
    pub fn with_enumerator(enumerator: E, device: DeviceConfig) -> Self {
        Self {
            enumerator,
            device,
            flasher: MmcFlasher::new(),
        }
    }
}

impl<E: UsbEnumerator> DeviceBackend for UsbBackend<E> {
    #[instrument(skip_all, fields(len = image.len()))]
    fn boot_recovery(&mut self, image: &[u8], cancel: &CancellationToken) -> Result<PathBuf> {
        let target = wait_for_recovery(
            &self.enumerator,
            &self.device.recovery,
            self.device.poll_interval(),
            cancel,
        )
        .context("Failed waiting for device in serial download mode")?
        .with_timeout(self.device.hid_timeout());
        info!(path = %target.info().path, "Detected device in serial download mode");

        let path = wait_for_block_device(
            &self.device.watch_dir,
            &self.device.block_device_glob,
            self.device.settle(),
            cancel,
            || {
                target
                    .boot_image(image)
                    .with_context(|| format!("Failed to SDP boot recovery image on {}", target.info().path))?;
                info!("Device booting recovery image");
                Ok(())
            },
        )
        .context("Failed to detect block device")?;
        Ok(path)
    }

    fn flash(&mut self, device: &Path, jobs: &[FlashJob]) -> Result<()> {
        Ok(self.flasher.flash(device, jobs)?)
    }

    fn wipe(
        &mut self,
        device: &Path,
        start_block: u64,
        blocks: u64,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<()> {
        Ok(self.flasher.wipe_region(device, start_block, blocks, on_progress)?)
    }

    fn read_at(&mut self, device: &Path, offset: u64, len: usize) -> Result<Vec<u8>> {
        read_block_device(device, offset, len)
    }

    fn wait_for_operational(&mut self, cancel: &CancellationToken) -> Result<Box<dyn OperationalDevice>> {
        let device = wait_for_operational(
            &self.enumerator,
            &self.device.operational,
            self.device.poll_interval(),
            cancel,
        )
        .context("Failed to find operational device")?;
        Ok(Box::new(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn image(len: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&(0..len).map(|i| i as u8).collect::<Vec<_>>()).unwrap();
        file
    }

    #[test]
    fn test_read_block_device_in_range() {
        let file = image(4096);
        let data = read_block_device(file.path(), 4000, 96).unwrap();
        assert_eq!(data.len(), 96);
        assert_eq!(data[0], (4000 % 256) as u8);
    }

    #[test]
    fn test_read_block_device_rejects_ranges_past_the_end() {
        let file = image(4096);
        let err = read_block_device(file.path(), 4000, 97).unwrap_err();
        assert!(err.to_string().contains("past the end"));

        // a length read from a corrupt config block
        let err = read_block_device(file.path(), 0, 1 << 62).unwrap_err();
        assert!(err.to_string().contains("past the end"));
        assert!(read_block_device(file.path(), u64::MAX, 2).is_err());
    }
}
