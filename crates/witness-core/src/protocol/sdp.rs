//! SDP command encoding.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use thiserror::Error;

use super::constants::*;

#[derive(Error, Debug)]
pub enum SdpCommandError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// SDP command (16 bytes, big endian)
///
/// Sent as the payload of an `H2D_COMMAND` report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SdpCommand {
    pub command_type: u16,
    pub address: u32,
    pub format: u8,
    pub data_count: u32,
    pub data: u32,
    pub reserved: u8,
}

impl SdpCommand {
    pub const SIZE: usize = SDP_COMMAND_SIZE;

    pub fn dcd_write(address: u32, len: u32) -> Self {
        Self {
            command_type: SDP_DCD_WRITE,
            address,
            data_count: len,
            ..Default::default()
        }
    }

    pub fn write_file(address: u32, len: u32) -> Self {
        Self {
            command_type: SDP_WRITE_FILE,
            address,
            data_count: len,
            ..Default::default()
        }
    }

    pub fn jump_address(address: u32) -> Self {
        Self {
            command_type: SDP_JUMP_ADDRESS,
            address,
            ..Default::default()
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SdpCommandError> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_u16::<BigEndian>(self.command_type)?;
        buf.write_u32::<BigEndian>(self.address)?;
        buf.write_u8(self.format)?;
        buf.write_u32::<BigEndian>(self.data_count)?;
        buf.write_u32::<BigEndian>(self.data)?;
        buf.write_u8(self.reserved)?;
        Ok(buf)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, SdpCommandError> {
        if data.len() < Self::SIZE {
            return Err(SdpCommandError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        Ok(Self {
            command_type: cursor.read_u16::<BigEndian>()?,
            address: cursor.read_u32::<BigEndian>()?,
            format: cursor.read_u8()?,
            data_count: cursor.read_u32::<BigEndian>()?,
            data: cursor.read_u32::<BigEndian>()?,
            reserved: cursor.read_u8()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_file_layout() {
        let cmd = SdpCommand::write_file(0x8780_0000, 0x1234);
        let bytes = cmd.to_bytes().unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(
            bytes,
            vec![0x04, 0x04, 0x87, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x12, 0x34, 0, 0, 0, 0, 0]
        );
        assert_eq!(SdpCommand::from_bytes(&bytes).unwrap(), cmd);
    }

    #[test]
    fn test_jump_and_dcd() {
        let jump = SdpCommand::jump_address(0x0091_0400).to_bytes().unwrap();
        assert_eq!(&jump[..6], &[0x0B, 0x0B, 0x00, 0x91, 0x04, 0x00]);

        let dcd = SdpCommand::dcd_write(OCRAM_STAGING_ADDR, 0x1F0).to_bytes().unwrap();
        assert_eq!(&dcd[..2], &[0x0A, 0x0A]);
        assert_eq!(&dcd[7..11], &[0x00, 0x00, 0x01, 0xF0]);
    }

    #[test]
    fn test_from_bytes_too_small() {
        assert!(matches!(
            SdpCommand::from_bytes(&[0u8; 15]),
            Err(SdpCommandError::BufferTooSmall { expected: 16, actual: 15 })
        ));
    }
}
