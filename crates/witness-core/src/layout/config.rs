//! Config block codec.
//!
//! A config block tells the bootloader where a firmware image lives and
//! carries the transparency proof bundle for that image. The encoded form is
//! always exactly [`CONFIG_MAX_LENGTH`] bytes:
//!
//! ```text
//! 0x00  magic "AWCF"
//! 0x04  version     u16 LE
//! 0x06  reserved    u16 LE
//! 0x08  offset      u64 LE   absolute byte address of the firmware
//! 0x10  size        u64 LE   firmware length in bytes
//! 0x18  log index   u64 LE
//! 0x20  checkpoint  u32 LE length + bytes
//!       manifest    u32 LE length + bytes
//!       proof       u32 LE count + count * 32 byte hashes
//!       zero padding up to CONFIG_MAX_LENGTH
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use thiserror::Error;

use super::CONFIG_MAX_LENGTH;
use crate::log::{HASH_SIZE, Hash};

pub const CONFIG_MAGIC: &[u8; 4] = b"AWCF";
pub const CONFIG_VERSION: u16 = 1;

/// Size of the fixed-width part of the header.
pub const FIXED_HEADER_SIZE: usize = 0x20;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Malformed config: {0}")]
    Malformed(String),
    #[error("Unsupported config version {0}")]
    UnsupportedVersion(u16),
    #[error("Config too large: {size} bytes, maximum {max}")]
    TooLarge { size: usize, max: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transparency proof material for one firmware image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProofBundle {
    /// Signed log checkpoint the inclusion proof is relative to.
    pub checkpoint: Vec<u8>,
    /// Signed firmware manifest, the log leaf.
    pub manifest: Vec<u8>,
    /// Index of the manifest leaf in the log.
    pub log_index: u64,
    /// Inclusion proof of the manifest at `log_index`.
    pub inclusion_proof: Vec<Hash>,
}

/// Decoded config block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigBlock {
    /// Absolute byte offset of the firmware on MMC.
    pub offset: u64,
    /// Firmware length in bytes.
    pub size: u64,
    pub bundle: ProofBundle,
}

impl ConfigBlock {
    /// Serialize the header without padding.
    pub fn header_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        let b = &self.bundle;
        let mut buf = Vec::with_capacity(
            FIXED_HEADER_SIZE + 12 + b.checkpoint.len() + b.manifest.len() + b.inclusion_proof.len() * HASH_SIZE,
        );
        buf.extend_from_slice(CONFIG_MAGIC);
        buf.write_u16::<LittleEndian>(CONFIG_VERSION)?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_u64::<LittleEndian>(self.offset)?;
        buf.write_u64::<LittleEndian>(self.size)?;
        buf.write_u64::<LittleEndian>(b.log_index)?;
        write_field(&mut buf, &b.checkpoint)?;
        write_field(&mut buf, &b.manifest)?;
        buf.write_u32::<LittleEndian>(b.inclusion_proof.len() as u32)?;
        for h in &b.inclusion_proof {
            buf.extend_from_slice(h);
        }
        Ok(buf)
    }

    /// Serialize and zero-pad to [`CONFIG_MAX_LENGTH`].
    pub fn encode(&self) -> Result<Vec<u8>, ConfigError> {
        let mut buf = self.header_bytes()?;
        if buf.len() > CONFIG_MAX_LENGTH {
            return Err(ConfigError::TooLarge {
                size: buf.len(),
                max: CONFIG_MAX_LENGTH,
            });
        }
        buf.resize(CONFIG_MAX_LENGTH, 0);
        Ok(buf)
    }

    /// Parse a config block. Anything past the encoded fields is padding and
    /// is ignored, as is anything beyond [`CONFIG_MAX_LENGTH`].
    pub fn decode(data: &[u8]) -> Result<Self, ConfigError> {
        let data = &data[..data.len().min(CONFIG_MAX_LENGTH)];
        if data.len() < FIXED_HEADER_SIZE {
            return Err(ConfigError::Malformed(format!(
                "need at least {} bytes, got {}",
                FIXED_HEADER_SIZE,
                data.len()
            )));
        }
        if &data[..4] != CONFIG_MAGIC {
            return Err(ConfigError::Malformed(format!(
                "bad magic {}",
                hex::encode(&data[..4])
            )));
        }

        let mut cursor = Cursor::new(&data[4..]);
        let version = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }
        let _reserved = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
        let offset = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
        let size = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
        let log_index = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
        let checkpoint = read_field(&mut cursor, "checkpoint")?;
        let manifest = read_field(&mut cursor, "manifest")?;

        let count = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        let remaining = remaining(&cursor);
        if count.saturating_mul(HASH_SIZE) > remaining {
            return Err(ConfigError::Malformed(format!(
                "inclusion proof of {count} hashes overruns block ({remaining} bytes left)"
            )));
        }
        let mut inclusion_proof = Vec::with_capacity(count);
        for _ in 0..count {
            let mut h = [0u8; HASH_SIZE];
            cursor.read_exact(&mut h).map_err(truncated)?;
            inclusion_proof.push(h);
        }

        Ok(Self {
            offset,
            size,
            bundle: ProofBundle {
                checkpoint,
                manifest,
                log_index,
                inclusion_proof,
            },
        })
    }
}

fn write_field(buf: &mut Vec<u8>, field: &[u8]) -> Result<(), ConfigError> {
    buf.write_u32::<LittleEndian>(field.len() as u32)?;
    buf.extend_from_slice(field);
    Ok(())
}

fn read_field(cursor: &mut Cursor<&[u8]>, name: &str) -> Result<Vec<u8>, ConfigError> {
    let len = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let left = remaining(cursor);
    if len > left {
        return Err(ConfigError::Malformed(format!(
            "{name} length {len} overruns block ({left} bytes left)"
        )));
    }
    let mut field = vec![0u8; len];
    cursor.read_exact(&mut field).map_err(truncated)?;
    Ok(field)
}

fn remaining(cursor: &Cursor<&[u8]>) -> usize {
    cursor.get_ref().len().saturating_sub(cursor.position() as usize)
}

fn truncated(e: std::io::Error) -> ConfigError {
    ConfigError::Malformed(format!("truncated header: {e}"))
}
