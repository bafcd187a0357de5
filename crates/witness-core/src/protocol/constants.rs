//! Protocol constants for the i.MX6UL/ULL serial download protocol and the
//! appliance's operational U2FHID interface.

use std::time::Duration;

// ============================================================================
// Device Identification
// ============================================================================

/// Freescale/NXP Vendor ID
pub const FREESCALE_VENDOR_ID: u16 = 0x15A2;

/// i.MX6UL in serial download mode ("SE Blank 6UL")
pub const IMX6UL_SDP_PID: u16 = 0x007D;
/// i.MX6ULL in serial download mode ("SE Blank 6ULL")
pub const IMX6ULL_SDP_PID: u16 = 0x0080;

/// Product IDs of the recovery persona
pub const RECOVERY_PIDS: &[u16] = &[IMX6UL_SDP_PID, IMX6ULL_SDP_PID];

/// Operational persona, configurable
pub const OPERATIONAL_VENDOR_ID: u16 = 0x1209;
pub const OPERATIONAL_PRODUCT_ID: u16 = 0x2702;
/// Vendor usage page of the operational U2FHID interface
pub const OPERATIONAL_USAGE_PAGE: u16 = 0xF1D0;

// ============================================================================
// HID Report IDs (SDP)
// ============================================================================

/// Host to device: 16 byte SDP command
pub const H2D_COMMAND: u8 = 1;
/// Host to device: data payload
pub const H2D_DATA: u8 = 2;
/// Device to host: HAB security status
pub const D2H_RESPONSE: u8 = 3;
/// Device to host: final command status
pub const D2H_RESPONSE_LAST: u8 = 4;

// ============================================================================
// SDP Command Types
// ============================================================================

pub const SDP_READ_REGISTER: u16 = 0x0101;
pub const SDP_WRITE_REGISTER: u16 = 0x0202;
pub const SDP_WRITE_FILE: u16 = 0x0404;
pub const SDP_ERROR_STATUS: u16 = 0x0505;
pub const SDP_DCD_WRITE: u16 = 0x0A0A;
pub const SDP_JUMP_ADDRESS: u16 = 0x0B0B;
pub const SDP_SKIP_DCD_HEADER: u16 = 0x0C0C;

// ============================================================================
// Sizes, Addresses and Timeouts
// ============================================================================

/// SDP command length in bytes
pub const SDP_COMMAND_SIZE: usize = 16;
/// Payload bytes carried by one H2D_DATA report
pub const SDP_CHUNK_SIZE: usize = 1024;
/// OCRAM staging address for DCD writes
pub const OCRAM_STAGING_ADDR: u32 = 0x0091_0000;
/// Default wait for an expected response report
pub const HID_TIMEOUT: Duration = Duration::from_secs(10);
