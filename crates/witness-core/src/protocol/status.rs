//! Device status and command responses (protobuf wire format).
//!
//! Only the fields the provisioning flow needs are modelled; unknown fields
//! are skipped.
//!
//! ```text
//! Status   { 1: serial, 2: hab (bool), 3: revision, 4: build, 5: version,
//!            6: runtime, 8: witness { 1: identity, 2: ip }, 10: srk_hash }
//! Response { 1: error (varint), 2: payload (bytes) }
//! ```

use std::io::{self, Cursor, Read, Write};
use thiserror::Error;

const WIRE_VARINT: u8 = 0;
const WIRE_I64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_I32: u8 = 5;

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("Truncated message")]
    Eof,
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("IO error: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for StatusError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            StatusError::Eof
        } else {
            StatusError::Io(e)
        }
    }
}

/// Device status as reported by the operational firmware.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    pub serial: String,
    /// Whether HAB secure boot is fused on.
    pub hab: bool,
    pub revision: String,
    pub build: String,
    pub version: String,
    pub runtime: String,
    /// Witness identity (verifier key) of the applet.
    pub identity: String,
    pub ip: String,
    /// Hex SRK hash fused (or to be fused) into the device.
    pub srk_hash: String,
}

impl DeviceStatus {
    pub fn decode(buf: &[u8]) -> Result<Self, StatusError> {
        let mut status = DeviceStatus::default();
        let mut reader = Cursor::new(buf);
        while (reader.position() as usize) < buf.len() {
            let (field, wire) = get_key(&mut reader)?;
            match (field, wire) {
                (1, WIRE_LEN) => status.serial = get_string(&mut reader)?,
                (2, WIRE_VARINT) => status.hab = get_varint(&mut reader)? != 0,
                (3, WIRE_LEN) => status.revision = get_string(&mut reader)?,
                (4, WIRE_LEN) => status.build = get_string(&mut reader)?,
                (5, WIRE_LEN) => status.version = get_string(&mut reader)?,
                (6, WIRE_LEN) => status.runtime = get_string(&mut reader)?,
                (8, WIRE_LEN) => {
                    let nested = get_bytes(&mut reader)?;
                    status.decode_witness(&nested)?;
                }
                (10, WIRE_LEN) => status.srk_hash = get_string(&mut reader)?,
                (_, wire) => skip(&mut reader, wire)?,
            }
        }
        Ok(status)
    }

    fn decode_witness(&mut self, buf: &[u8]) -> Result<(), StatusError> {
        let mut reader = Cursor::new(buf);
        while (reader.position() as usize) < buf.len() {
            match get_key(&mut reader)? {
                (1, WIRE_LEN) => self.identity = get_string(&mut reader)?,
                (2, WIRE_LEN) => self.ip = get_string(&mut reader)?,
                (_, wire) => skip(&mut reader, wire)?,
            }
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, StatusError> {
        let mut out = Vec::new();
        put_string(&mut out, 1, &self.serial)?;
        if self.hab {
            put_key(&mut out, 2, WIRE_VARINT)?;
            put_varint(&mut out, 1)?;
        }
        put_string(&mut out, 3, &self.revision)?;
        put_string(&mut out, 4, &self.build)?;
        put_string(&mut out, 5, &self.version)?;
        put_string(&mut out, 6, &self.runtime)?;

        let mut witness = Vec::new();
        put_string(&mut witness, 1, &self.identity)?;
        put_string(&mut witness, 2, &self.ip)?;
        if !witness.is_empty() {
            put_bytes(&mut out, 8, &witness)?;
        }
        put_string(&mut out, 10, &self.srk_hash)?;
        Ok(out)
    }
}

/// Generic command response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResponse {
    /// Zero on success.
    pub error: u64,
    pub payload: Vec<u8>,
}

impl CommandResponse {
    pub fn decode(buf: &[u8]) -> Result<Self, StatusError> {
        let mut response = CommandResponse::default();
        let mut reader = Cursor::new(buf);
        while (reader.position() as usize) < buf.len() {
            match get_key(&mut reader)? {
                (1, WIRE_VARINT) => response.error = get_varint(&mut reader)?,
                (2, WIRE_LEN) => response.payload = get_bytes(&mut reader)?,
                (_, wire) => skip(&mut reader, wire)?,
            }
        }
        Ok(response)
    }

    pub fn encode(&self) -> Result<Vec<u8>, StatusError> {
        let mut out = Vec::new();
        if self.error != 0 {
            put_key(&mut out, 1, WIRE_VARINT)?;
            put_varint(&mut out, self.error)?;
        }
        if !self.payload.is_empty() {
            put_bytes(&mut out, 2, &self.payload)?;
        }
        Ok(out)
    }
}

fn get_varint(reader: &mut impl Read) -> Result<u64, StatusError> {
    let mut v: u64 = 0;
    for i in 0..10 {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        v |= ((byte[0] & 0x7f) as u64) << (i * 7);
        if (byte[0] & 0x80) == 0 {
            return Ok(v);
        }
    }
    Err(StatusError::Malformed("varint too long".to_string()))
}

fn get_key(reader: &mut impl Read) -> Result<(u64, u8), StatusError> {
    let key = get_varint(reader)?;
    Ok((key >> 3, (key & 0x7) as u8))
}

fn get_bytes(reader: &mut Cursor<&[u8]>) -> Result<Vec<u8>, StatusError> {
    let len = get_varint(reader)? as usize;
    let left = reader.get_ref().len() - reader.position() as usize;
    if len > left {
        return Err(StatusError::Eof);
    }
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn get_string(reader: &mut Cursor<&[u8]>) -> Result<String, StatusError> {
    String::from_utf8(get_bytes(reader)?)
        .map_err(|_| StatusError::Malformed("string field is not UTF-8".to_string()))
}

fn skip(reader: &mut Cursor<&[u8]>, wire: u8) -> Result<(), StatusError> {
    let n = match wire {
        WIRE_VARINT => {
            get_varint(reader)?;
            return Ok(());
        }
        WIRE_I64 => 8,
        WIRE_LEN => {
            get_bytes(reader)?;
            return Ok(());
        }
        WIRE_I32 => 4,
        other => return Err(StatusError::Malformed(format!("unsupported wire type {other}"))),
    };
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf[..n])?;
    Ok(())
}

fn put_varint(writer: &mut impl Write, mut v: u64) -> Result<(), StatusError> {
    let mut byte = [0u8; 1];
    loop {
        byte[0] = (v & 0x7f) as u8;
        if v > 0x7f {
            byte[0] |= 0x80;
        }
        writer.write_all(&byte)?;
        v >>= 7;
        if v == 0 {
            return Ok(());
        }
    }
}

fn put_key(writer: &mut impl Write, field: u64, wire: u8) -> Result<(), StatusError> {
    put_varint(writer, (field << 3) | wire as u64)
}

fn put_bytes(writer: &mut impl Write, field: u64, bytes: &[u8]) -> Result<(), StatusError> {
    put_key(writer, field, WIRE_LEN)?;
    put_varint(writer, bytes.len() as u64)?;
    writer.write_all(bytes)?;
    Ok(())
}

fn put_string(writer: &mut impl Write, field: u64, s: &str) -> Result<(), StatusError> {
    if s.is_empty() {
        return Ok(());
    }
    put_bytes(writer, field, s.as_bytes())
}
