//! Firmware release manifest, the leaf committed to the firmware log.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::bundle::Component;

/// Claims made by a firmware release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareRelease {
    pub component: Component,
    pub git_tag_name: String,
    /// Hex commit hash the release was built from.
    pub git_commit_fingerprint: String,
    #[serde(with = "b64")]
    pub firmware_digest_sha256: Vec<u8>,
    pub tamago_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hab: Option<HabTarget>,
}

/// HAB signing details for releases that ship a signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HabTarget {
    pub target: String,
    #[serde(with = "b64")]
    pub signature_digest_sha256: Vec<u8>,
}

impl FirmwareRelease {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Manifest body text as it is signed: JSON plus a trailing newline.
    pub fn to_note_text(&self) -> Result<String, serde_json::Error> {
        let mut text = serde_json::to_string(self)?;
        text.push('\n');
        Ok(text)
    }
}

mod b64 {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
