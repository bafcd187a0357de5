//! i.MX boot image parsing (IVT and DCD).
//!
//! An imx image starts with a 32 byte Image Vector Table. Its header is a
//! tag byte, a big-endian length and a version byte; the remaining words are
//! little-endian addresses in the load address space. The DCD is located in
//! the file at `ivt.dcd - ivt.self_addr`.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use thiserror::Error;

pub const IVT_TAG: u8 = 0xD1;
pub const IVT_SIZE: usize = 32;
pub const DCD_TAG: u8 = 0xD2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImxError {
    #[error("Image too small for IVT: {0} bytes")]
    TooSmall(usize),
    #[error("Invalid IVT header: tag 0x{tag:02X}, length {length}, version 0x{version:02X}")]
    InvalidIvt { tag: u8, length: u16, version: u8 },
    #[error("Image has no DCD")]
    NoDcd,
    #[error("DCD at 0x{dcd:08X} lies outside the image loaded at 0x{self_addr:08X}")]
    DcdOutOfRange { dcd: u32, self_addr: u32 },
    #[error("Invalid DCD header: tag 0x{tag:02X}, length {length}")]
    InvalidDcd { tag: u8, length: u16 },
}

/// Image Vector Table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ivt {
    pub version: u8,
    pub entry: u32,
    pub dcd: u32,
    pub boot_data: u32,
    /// Load address of the IVT itself.
    pub self_addr: u32,
    pub csf: u32,
}

impl Ivt {
    pub fn parse(image: &[u8]) -> Result<Self, ImxError> {
        if image.len() < IVT_SIZE {
            return Err(ImxError::TooSmall(image.len()));
        }
        let tag = image[0];
        let length = BigEndian::read_u16(&image[1..3]);
        let version = image[3];
        if tag != IVT_TAG || length as usize != IVT_SIZE || !(0x40..=0x43).contains(&version) {
            return Err(ImxError::InvalidIvt { tag, length, version });
        }

        Ok(Self {
            version,
            entry: LittleEndian::read_u32(&image[4..8]),
            dcd: LittleEndian::read_u32(&image[12..16]),
            boot_data: LittleEndian::read_u32(&image[16..20]),
            self_addr: LittleEndian::read_u32(&image[20..24]),
            csf: LittleEndian::read_u32(&image[24..28]),
        })
    }

    /// Slice out the DCD table, header included.
    pub fn dcd<'a>(&self, image: &'a [u8]) -> Result<&'a [u8], ImxError> {
        if self.dcd == 0 {
            return Err(ImxError::NoDcd);
        }
        let out_of_range = || ImxError::DcdOutOfRange {
            dcd: self.dcd,
            self_addr: self.self_addr,
        };
        let offset = self.dcd.checked_sub(self.self_addr).ok_or_else(out_of_range)? as usize;
        if offset + 4 > image.len() {
            return Err(out_of_range());
        }

        let tag = image[offset];
        let length = BigEndian::read_u16(&image[offset + 1..offset + 3]);
        if tag != DCD_TAG || (length as usize) < 4 || offset + length as usize > image.len() {
            return Err(ImxError::InvalidDcd { tag, length });
        }
        Ok(&image[offset..offset + length as usize])
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal imx image: IVT at 0x87800000, DCD right after it.
    pub(crate) fn sample_image(payload_len: usize) -> Vec<u8> {
        let self_addr: u32 = 0x8780_0000;
        let mut image = vec![0u8; IVT_SIZE];
        image[0] = IVT_TAG;
        image[1..3].copy_from_slice(&(IVT_SIZE as u16).to_be_bytes());
        image[3] = 0x40;
        image[4..8].copy_from_slice(&(self_addr + 0x1000).to_le_bytes());
        image[12..16].copy_from_slice(&(self_addr + IVT_SIZE as u32).to_le_bytes());
        image[20..24].copy_from_slice(&self_addr.to_le_bytes());

        // DCD: header + one write command (tag 0xCC, len 12, one addr/value pair).
        let dcd = [
            DCD_TAG, 0x00, 0x10, 0x41, 0xCC, 0x00, 0x0C, 0x04, 0x02, 0x0C, 0x40, 0x68, 0xFF, 0xFF,
            0xFF, 0xFF,
        ];
        image.extend_from_slice(&dcd);
        image.extend((0..payload_len).map(|i| i as u8));
        image
    }

    #[test]
    fn test_parse_ivt_and_dcd() {
        let image = sample_image(100);
        let ivt = Ivt::parse(&image).unwrap();
        assert_eq!(ivt.self_addr, 0x8780_0000);
        assert_eq!(ivt.entry, 0x8780_1000);
        assert_eq!(ivt.dcd, 0x8780_0020);

        let dcd = ivt.dcd(&image).unwrap();
        assert_eq!(dcd.len(), 16);
        assert_eq!(dcd[0], DCD_TAG);
    }

    #[test]
    fn test_invalid_ivt() {
        let mut image = sample_image(0);
        image[0] = 0x00;
        assert!(matches!(Ivt::parse(&image), Err(ImxError::InvalidIvt { .. })));
        assert_eq!(Ivt::parse(&image[..10]), Err(ImxError::TooSmall(10)));
    }

    #[test]
    fn test_dcd_errors() {
        let image = sample_image(0);
        let mut ivt = Ivt::parse(&image).unwrap();

        ivt.dcd = 0;
        assert_eq!(ivt.dcd(&image), Err(ImxError::NoDcd));

        ivt.dcd = 0x8000_0000;
        assert!(matches!(ivt.dcd(&image), Err(ImxError::DcdOutOfRange { .. })));

        let mut bad = image.clone();
        bad[IVT_SIZE] = 0xAA;
        let ivt = Ivt::parse(&bad).unwrap();
        assert!(matches!(ivt.dcd(&bad), Err(ImxError::InvalidDcd { .. })));
    }
}
