//! U2FHID (CTAPHID) message framing.
//!
//! Messages travel in 64 byte reports on a channel. The first report of a
//! message is an initialization packet, the rest are continuation packets:
//!
//! ```text
//! init: CID(4) | CMD | 0x80 (1) | BCNTH | BCNTL | DATA(57)
//! cont: CID(4) | SEQ (1)        | DATA(59)
//! ```

use thiserror::Error;

pub const HID_REPORT_SIZE: usize = 64;
pub const INIT_DATA_SIZE: usize = HID_REPORT_SIZE - 7;
pub const CONT_DATA_SIZE: usize = HID_REPORT_SIZE - 5;
/// Largest payload a message can carry (one init + 128 continuation packets).
pub const MAX_PAYLOAD: usize = INIT_DATA_SIZE + 128 * CONT_DATA_SIZE;

pub const BROADCAST_CID: u32 = 0xFFFF_FFFF;
pub const TYPE_INIT: u8 = 0x80;

pub const CMD_PING: u8 = 0x01;
pub const CMD_MSG: u8 = 0x03;
pub const CMD_INIT: u8 = 0x06;
pub const CMD_ERROR: u8 = 0x3F;

/// First vendor specific command.
pub const CMD_VENDOR_FIRST: u8 = 0x40;
/// Device information (status) query.
pub const CMD_ARMORY_INF: u8 = CMD_VENDOR_FIRST;
/// Irreversible HAB activation.
pub const CMD_ARMORY_HAB: u8 = CMD_VENDOR_FIRST + 1;

pub const INIT_NONCE_SIZE: usize = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("Short report: {0} bytes")]
    ShortReport(usize),
    #[error("Unexpected continuation packet")]
    UnexpectedContinuation,
    #[error("Out of order packet: expected sequence {expected}, got {actual}")]
    Sequence { expected: u8, actual: u8 },
}

/// Split a message into reports.
pub fn encode_message(cid: u32, cmd: u8, payload: &[u8]) -> Result<Vec<[u8; HID_REPORT_SIZE]>, FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }

    let mut reports = Vec::new();
    let mut init = [0u8; HID_REPORT_SIZE];
    init[..4].copy_from_slice(&cid.to_be_bytes());
    init[4] = TYPE_INIT | cmd;
    init[5..7].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    let first = payload.len().min(INIT_DATA_SIZE);
    init[7..7 + first].copy_from_slice(&payload[..first]);
    reports.push(init);

    for (seq, chunk) in payload[first..].chunks(CONT_DATA_SIZE).enumerate() {
        let mut cont = [0u8; HID_REPORT_SIZE];
        cont[..4].copy_from_slice(&cid.to_be_bytes());
        cont[4] = seq as u8;
        cont[5..5 + chunk.len()].copy_from_slice(chunk);
        reports.push(cont);
    }
    Ok(reports)
}

/// First Usage Page item of a HID report descriptor.
pub fn report_usage_page(descriptor: &[u8]) -> Option<u16> {
    let mut i = 0;
    while i < descriptor.len() {
        let prefix = descriptor[i];
        if prefix == 0xFE {
            // long item: bDataSize follows the prefix
            let size = *descriptor.get(i + 1)? as usize;
            i += 3 + size;
            continue;
        }
        let size = match prefix & 0x03 {
            3 => 4,
            n => n as usize,
        };
        let data = descriptor.get(i + 1..i + 1 + size)?;
        // Usage Page is a global item with tag 0
        if prefix & 0xFC == 0x04 {
            return match data {
                [lo] => Some(*lo as u16),
                [lo, hi] | [lo, hi, _, _] => Some(u16::from_le_bytes([*lo, *hi])),
                _ => None,
            };
        }
        i += 1 + size;
    }
    None
}

/// A reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub cid: u32,
    pub cmd: u8,
    pub payload: Vec<u8>,
}

/// Reassembles messages for one channel, ignoring reports for others.
#[derive(Debug)]
pub struct MessageAssembler {
    cid: u32,
    pending: Option<(u8, usize, Vec<u8>)>,
    next_seq: u8,
}

impl MessageAssembler {
    pub fn new(cid: u32) -> Self {
        Self {
            cid,
            pending: None,
            next_seq: 0,
        }
    }

    /// Feed one report. Returns the message once complete.
    pub fn push(&mut self, report: &[u8]) -> Result<Option<Message>, FrameError> {
        if report.len() < 5 {
            return Err(FrameError::ShortReport(report.len()));
        }
        let cid = u32::from_be_bytes([report[0], report[1], report[2], report[3]]);
        if cid != self.cid {
            return Ok(None);
        }

        if report[4] & TYPE_INIT != 0 {
            if report.len() < 7 {
                return Err(FrameError::ShortReport(report.len()));
            }
            let cmd = report[4] & !TYPE_INIT;
            let len = u16::from_be_bytes([report[5], report[6]]) as usize;
            let take = len.min(INIT_DATA_SIZE).min(report.len() - 7);
            let mut data = Vec::with_capacity(len);
            data.extend_from_slice(&report[7..7 + take]);
            self.pending = Some((cmd, len, data));
            self.next_seq = 0;
        } else {
            let seq = report[4];
            let Some((_, len, data)) = self.pending.as_mut() else {
                return Err(FrameError::UnexpectedContinuation);
            };
            if seq != self.next_seq {
                return Err(FrameError::Sequence {
                    expected: self.next_seq,
                    actual: seq,
                });
            }
            self.next_seq = self.next_seq.wrapping_add(1);
            let take = (*len - data.len()).min(CONT_DATA_SIZE).min(report.len() - 5);
            data.extend_from_slice(&report[5..5 + take]);
        }

        let complete = matches!(&self.pending, Some((_, len, data)) if data.len() >= *len);
        if complete {
            if let Some((cmd, _, payload)) = self.pending.take() {
                return Ok(Some(Message {
                    cid: self.cid,
                    cmd,
                    payload,
                }));
            }
        }
        Ok(None)
    }
}
