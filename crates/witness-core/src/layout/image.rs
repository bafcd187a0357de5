//! MMC image preparation.

use super::{BOOTLOADER_BLOCK, CONFIG_MAX_LENGTH, ConfigBlock, ConfigError, block_offset};
use crate::bundle::FirmwareBundle;

/// Absolute byte offset of a firmware image whose config block starts at `block`.
pub const fn firmware_offset(block: u64) -> u64 {
    block_offset(block) + CONFIG_MAX_LENGTH as u64
}

/// Config block describing a component stored at `block`.
pub fn config_block(bundle: &FirmwareBundle, block: u64) -> ConfigBlock {
    ConfigBlock {
        offset: firmware_offset(block),
        size: bundle.firmware.len() as u64,
        bundle: bundle.proof_bundle(),
    }
}

/// Build `[config block | zero pad | firmware]` for a component stored at `block`.
pub fn prepare_image(bundle: &FirmwareBundle, block: u64) -> Result<Vec<u8>, ConfigError> {
    let mut image = config_block(bundle, block).encode()?;
    image.extend_from_slice(&bundle.firmware);
    Ok(image)
}

/// Build the standalone config block for the bootloader.
///
/// The bootloader is loaded by the ROM from [`BOOTLOADER_BLOCK`], so its
/// config block is written separately and never prepended to the image.
pub fn bootloader_config(bundle: &FirmwareBundle) -> Result<Vec<u8>, ConfigError> {
    ConfigBlock {
        offset: block_offset(BOOTLOADER_BLOCK),
        size: bundle.firmware.len() as u64,
        bundle: bundle.proof_bundle(),
    }
    .encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::OS_BLOCK;

    fn bundle(firmware: Vec<u8>) -> FirmwareBundle {
        FirmwareBundle {
            firmware,
            hab_signature: None,
            checkpoint: b"log\n3\nAAAA\n".to_vec(),
            manifest: b"{}".to_vec(),
            log_index: 1,
            inclusion_proof: vec![[7u8; 32]],
        }
    }

    #[test]
    fn test_prepare_image_layout() {
        let fw: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let image = prepare_image(&bundle(fw.clone()), OS_BLOCK).unwrap();

        assert_eq!(image.len(), CONFIG_MAX_LENGTH + fw.len());
        assert_eq!(&image[CONFIG_MAX_LENGTH..], &fw[..]);

        let config = ConfigBlock::decode(&image).unwrap();
        assert_eq!(config.offset, OS_BLOCK * 512 + CONFIG_MAX_LENGTH as u64);
        assert_eq!(config.size, fw.len() as u64);
        assert_eq!(config.bundle.log_index, 1);
    }

    #[test]
    fn test_bootloader_config_is_standalone() {
        let fw = vec![0xAA; 1234];
        let config_bytes = bootloader_config(&bundle(fw)).unwrap();
        assert_eq!(config_bytes.len(), CONFIG_MAX_LENGTH);

        let config = ConfigBlock::decode(&config_bytes).unwrap();
        assert_eq!(config.offset, BOOTLOADER_BLOCK * 512);
        assert_eq!(config.size, 1234);
    }
}
