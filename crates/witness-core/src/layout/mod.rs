//! MMC layout of the witness appliance.
//!
//! The ROM bootloader loads the bootloader image from a fixed early block, so
//! the bootloader's config block lives at its own location. Every other
//! component is stored as `[config block | zero pad | firmware]`.

pub mod config;
pub mod image;

pub use config::{ConfigBlock, ConfigError, ProofBundle};
pub use image::{bootloader_config, config_block, firmware_offset, prepare_image};

/// Block size in bytes of the MMC device.
pub const MMC_BLOCK_SIZE: u64 = 512;

/// Maximum serialized length of a config block (0x50 blocks).
pub const CONFIG_MAX_LENGTH: usize = 40960;

/// First block of the bootloader image.
pub const BOOTLOADER_BLOCK: u64 = 0x2;
/// Block holding the bootloader's config block.
pub const BOOTLOADER_CONFIG_BLOCK: u64 = 0x4FB0;
/// First block of the trusted OS config block + image.
pub const OS_BLOCK: u64 = 0x5000;
/// First block of the trusted applet config block + image.
pub const APPLET_BLOCK: u64 = 0x200000;

/// Applet data region, `[start, end)` in blocks.
pub const APPLET_DATA_START_BLOCK: u64 = 0x400000;
pub const APPLET_DATA_END_BLOCK: u64 = 0x800000;

/// Convert a block number to an absolute byte offset.
pub const fn block_offset(block: u64) -> u64 {
    block * MMC_BLOCK_SIZE
}
