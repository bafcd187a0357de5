//! Firmware bundles and where they come from.
//!
//! A bundle is a firmware image plus the transparency material proving that
//! its manifest is committed to the firmware log. Bundles are read from a
//! JSON descriptor that references sibling files:
//!
//! ```json
//! {
//!   "component": "TRUSTED_OS",
//!   "firmware": "trusted_os.elf",
//!   "manifest": "trusted_os.manifest",
//!   "checkpoint": "checkpoint",
//!   "log_index": 5,
//!   "inclusion_proof": ["base64...", "base64..."]
//! }
//! ```

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::layout::ProofBundle;
use crate::log::{HASH_SIZE, Hash};

/// Firmware components of the appliance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Component {
    Bootloader,
    TrustedOs,
    TrustedApplet,
    Recovery,
}

impl Component {
    pub const ALL: [Component; 4] = [
        Component::Recovery,
        Component::Bootloader,
        Component::TrustedOs,
        Component::TrustedApplet,
    ];
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Bootloader => write!(f, "bootloader"),
            Component::TrustedOs => write!(f, "trusted OS"),
            Component::TrustedApplet => write!(f, "trusted applet"),
            Component::Recovery => write!(f, "recovery"),
        }
    }
}

/// Firmware image with its proof bundle. Immutable once fetched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareBundle {
    pub firmware: Vec<u8>,
    /// Detached HAB signature, appended to the image when booting a fused device.
    pub hab_signature: Option<Vec<u8>>,
    pub checkpoint: Vec<u8>,
    pub manifest: Vec<u8>,
    pub log_index: u64,
    pub inclusion_proof: Vec<Hash>,
}

impl FirmwareBundle {
    pub fn proof_bundle(&self) -> ProofBundle {
        ProofBundle {
            checkpoint: self.checkpoint.clone(),
            manifest: self.manifest.clone(),
            log_index: self.log_index,
            inclusion_proof: self.inclusion_proof.clone(),
        }
    }

    /// Rebuild a bundle from firmware read back off the device.
    pub fn from_parts(firmware: Vec<u8>, proof: ProofBundle) -> Self {
        Self {
            firmware,
            hab_signature: None,
            checkpoint: proof.checkpoint,
            manifest: proof.manifest,
            log_index: proof.log_index,
            inclusion_proof: proof.inclusion_proof,
        }
    }

    /// Firmware with the HAB signature appended, if there is one.
    pub fn signed_image(&self) -> Vec<u8> {
        let mut image = self.firmware.clone();
        if let Some(sig) = &self.hab_signature {
            image.extend_from_slice(sig);
        }
        image
    }

    pub fn firmware_digest(&self) -> [u8; 32] {
        Sha256::digest(&self.firmware).into()
    }
}

/// The four bundles a provisioning run needs.
#[derive(Debug, Clone)]
pub struct FirmwareSet {
    pub recovery: FirmwareBundle,
    pub bootloader: FirmwareBundle,
    pub os: FirmwareBundle,
    pub applet: FirmwareBundle,
}

impl FirmwareSet {
    pub fn fetch(fetcher: &dyn BundleFetcher) -> Result<Self> {
        Ok(Self {
            recovery: fetcher.fetch(Component::Recovery)?,
            bootloader: fetcher.fetch(Component::Bootloader)?,
            os: fetcher.fetch(Component::TrustedOs)?,
            applet: fetcher.fetch(Component::TrustedApplet)?,
        })
    }

    pub fn get(&self, component: Component) -> &FirmwareBundle {
        match component {
            Component::Recovery => &self.recovery,
            Component::Bootloader => &self.bootloader,
            Component::TrustedOs => &self.os,
            Component::TrustedApplet => &self.applet,
        }
    }
}

/// Source of firmware bundles.
pub trait BundleFetcher {
    fn fetch(&self, component: Component) -> Result<FirmwareBundle>;
}

/// On-disk description of a bundle. Paths are relative to the descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleDescriptor {
    pub component: Component,
    pub firmware: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hab_signature: Option<PathBuf>,
    pub manifest: PathBuf,
    pub checkpoint: PathBuf,
    pub log_index: u64,
    /// Base64 encoded proof hashes.
    #[serde(default)]
    pub inclusion_proof: Vec<String>,
}

impl BundleDescriptor {
    pub fn load(path: &Path) -> Result<FirmwareBundle> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read bundle descriptor {}", path.display()))?;
        let descriptor: BundleDescriptor = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse bundle descriptor {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        descriptor.resolve(base)
    }

    fn resolve(&self, base: &Path) -> Result<FirmwareBundle> {
        let read = |p: &Path| {
            let full = base.join(p);
            std::fs::read(&full).with_context(|| format!("Failed to read {}", full.display()))
        };

        let mut inclusion_proof = Vec::with_capacity(self.inclusion_proof.len());
        for (i, h) in self.inclusion_proof.iter().enumerate() {
            let bytes = STANDARD
                .decode(h)
                .with_context(|| format!("Inclusion proof hash {i} is not base64"))?;
            let hash: Hash = bytes.as_slice().try_into().map_err(|_| {
                anyhow::anyhow!(
                    "Inclusion proof hash {i} has {} bytes, expected {HASH_SIZE}",
                    bytes.len()
                )
            })?;
            inclusion_proof.push(hash);
        }

        Ok(FirmwareBundle {
            firmware: read(&self.firmware)?,
            hab_signature: self.hab_signature.as_deref().map(read).transpose()?,
            checkpoint: read(&self.checkpoint)?,
            manifest: read(&self.manifest)?,
            log_index: self.log_index,
            inclusion_proof,
        })
    }
}

/// Reads bundles from descriptor files, one per component.
#[derive(Debug, Clone, Default)]
pub struct DirectoryBundleFetcher {
    descriptors: HashMap<Component, PathBuf>,
}

impl DirectoryBundleFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_descriptor(mut self, component: Component, path: impl Into<PathBuf>) -> Self {
        self.descriptors.insert(component, path.into());
        self
    }
}

impl BundleFetcher for DirectoryBundleFetcher {
    fn fetch(&self, component: Component) -> Result<FirmwareBundle> {
        let Some(path) = self.descriptors.get(&component) else {
            bail!("No bundle configured for {component}");
        };
        debug!(component = %component, path = %path.display(), "Loading bundle");
        let bundle = BundleDescriptor::load(path)?;
        info!(
            component = %component,
            size = bundle.firmware.len(),
            log_index = bundle.log_index,
            "Loaded firmware bundle"
        );
        Ok(bundle)
    }
}
