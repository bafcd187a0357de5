//! Flash job lists for a provisioning run.

use crate::bundle::FirmwareSet;
use crate::flash::FlashJob;
use crate::layout::{
    APPLET_BLOCK, BOOTLOADER_BLOCK, BOOTLOADER_CONFIG_BLOCK, ConfigError, OS_BLOCK, bootloader_config,
    prepare_image,
};

pub const BOOTLOADER_JOB: &str = "bootloader";
pub const BOOTLOADER_CONFIG_JOB: &str = "bootloader config";
pub const OS_JOB: &str = "trusted OS";
pub const APPLET_JOB: &str = "trusted applet";

/// Jobs for the first flashing stage, in write order.
///
/// When `fuse` is set the applet job is all zeroes of the real image's
/// length; the real applet goes on after fusing, see [`applet_job`].
pub fn flash_jobs(firmware: &FirmwareSet, fuse: bool) -> Result<Vec<FlashJob>, ConfigError> {
    let applet = applet_job(firmware)?;
    let applet = if fuse {
        FlashJob::new(APPLET_JOB, vec![0; applet.image.len()], applet.start_block)
    } else {
        applet
    };

    Ok(vec![
        FlashJob::new(BOOTLOADER_JOB, firmware.bootloader.signed_image(), BOOTLOADER_BLOCK),
        FlashJob::new(
            BOOTLOADER_CONFIG_JOB,
            bootloader_config(&firmware.bootloader)?,
            BOOTLOADER_CONFIG_BLOCK,
        ),
        FlashJob::new(OS_JOB, prepare_image(&firmware.os, OS_BLOCK)?, OS_BLOCK),
        applet,
    ])
}

/// The real applet, config block included.
pub fn applet_job(firmware: &FirmwareSet) -> Result<FlashJob, ConfigError> {
    Ok(FlashJob::new(
        APPLET_JOB,
        prepare_image(&firmware.applet, APPLET_BLOCK)?,
        APPLET_BLOCK,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::FirmwareBundle;
    use crate::layout::{CONFIG_MAX_LENGTH, ConfigBlock, firmware_offset};

    fn bundle(fill: u8, len: usize) -> FirmwareBundle {
        FirmwareBundle {
            firmware: vec![fill; len],
            hab_signature: None,
            checkpoint: b"log\n1\nAAAA\n".to_vec(),
            manifest: vec![fill],
            log_index: 0,
            inclusion_proof: Vec::new(),
        }
    }

    fn firmware() -> FirmwareSet {
        let mut bootloader = bundle(0xB0, 100);
        bootloader.hab_signature = Some(vec![0x51; 16]);
        FirmwareSet {
            recovery: bundle(0xEC, 10),
            bootloader,
            os: bundle(0x05, 300),
            applet: bundle(0xA9, 200),
        }
    }

    #[test]
    fn test_job_layout() {
        let jobs = flash_jobs(&firmware(), false).unwrap();
        let blocks: Vec<u64> = jobs.iter().map(|j| j.start_block).collect();
        assert_eq!(blocks, vec![0x2, 0x4FB0, 0x5000, 0x200000]);

        // signature appended to the bootloader, no config block in front
        assert_eq!(jobs[0].image.len(), 116);
        assert_eq!(jobs[0].image[0], 0xB0);

        let config = ConfigBlock::decode(&jobs[1].image).unwrap();
        assert_eq!(config.offset, 0x2 * 512);
        assert_eq!(config.size, 100);

        let os = ConfigBlock::decode(&jobs[2].image[..CONFIG_MAX_LENGTH]).unwrap();
        assert_eq!(os.offset, firmware_offset(0x5000));
        assert_eq!(&jobs[2].image[CONFIG_MAX_LENGTH..], &[0x05; 300][..]);

        assert_eq!(jobs[3].image[CONFIG_MAX_LENGTH..], [0xA9; 200][..]);
    }

    #[test]
    fn test_fusing_defers_applet() {
        let set = firmware();
        let jobs = flash_jobs(&set, true).unwrap();
        let real = applet_job(&set).unwrap();

        assert_eq!(jobs[3].label, APPLET_JOB);
        assert_eq!(jobs[3].start_block, real.start_block);
        assert_eq!(jobs[3].image.len(), real.image.len());
        assert!(jobs[3].image.iter().all(|&b| b == 0));
    }
}
