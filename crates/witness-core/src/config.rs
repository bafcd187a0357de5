//! Provisioning configuration.
//!
//! Built once from a TOML file plus command line overrides, then handed to
//! the session and never mutated again.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::bundle::{Component, DirectoryBundleFetcher};
use crate::detect::{POLL_INTERVAL, PersonaFilter};
use crate::log::{DirFetcher, Ed25519Verifier, LogStateTracker, NoteVerifier};
use crate::protocol::HID_TIMEOUT;
use crate::verify::{BundleVerifier, VerifierSet};

/// Bundle descriptor per component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    pub recovery: Option<PathBuf>,
    pub bootloader: Option<PathBuf>,
    pub os: Option<PathBuf>,
    pub applet: Option<PathBuf>,
}

/// Firmware transparency log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Expected first line of the log's checkpoints.
    pub origin: String,
    /// Checkpoint verifier key (`name+hash+key`).
    pub verifier: String,
    /// Local directory holding `checkpoint` and `tile/`.
    pub root: PathBuf,
    /// Where the last trusted checkpoint is kept between runs.
    pub state_file: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            origin: String::new(),
            verifier: String::new(),
            root: PathBuf::from("log"),
            state_file: PathBuf::from("witness-log.state"),
        }
    }
}

/// Manifest verifier keys per component. Every listed key must sign.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierKeys {
    pub recovery: Vec<String>,
    pub bootloader: Vec<String>,
    pub os: Vec<String>,
    pub applet: Vec<String>,
}

impl VerifierKeys {
    pub fn get(&self, component: Component) -> &[String] {
        match component {
            Component::Recovery => &self.recovery,
            Component::Bootloader => &self.bootloader,
            Component::TrustedOs => &self.os,
            Component::TrustedApplet => &self.applet,
        }
    }
}

/// USB identities and host side device discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub recovery: PersonaFilter,
    pub operational: PersonaFilter,
    /// Directory watched for the mass-storage block device.
    pub watch_dir: PathBuf,
    /// Glob a new block device must match.
    pub block_device_glob: String,
    /// Delay after the block device appears.
    pub settle_secs: u64,
    /// SDP command timeout.
    pub hid_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            recovery: PersonaFilter::recovery(),
            operational: PersonaFilter::operational(),
            watch_dir: PathBuf::from("/dev"),
            block_device_glob: "/dev/sd*".to_string(),
            settle_secs: 5,
            hid_timeout_ms: HID_TIMEOUT.as_millis() as u64,
            poll_interval_ms: POLL_INTERVAL.as_millis() as u64,
        }
    }
}

impl DeviceConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn hid_timeout(&self) -> Duration {
        Duration::from_millis(self.hid_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Behaviour switches for a provisioning run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionOptions {
    /// Irreversibly enable HAB secure boot.
    pub fuse: bool,
    /// Continue past failed safety checks, with a warning.
    pub override_safety: bool,
    /// Zero the applet data region after flashing.
    pub wipe_applet_data: bool,
    /// SRK hash the device must report before fusing (hex).
    pub expected_srk_hash: Option<String>,
    /// Countdown before destructive steps.
    pub countdown_secs: u64,
    /// Give up waiting for a device after this long.
    pub wait_timeout_secs: Option<u64>,
}

impl Default for ProvisionOptions {
    fn default() -> Self {
        Self {
            fuse: false,
            override_safety: false,
            wipe_applet_data: false,
            expected_srk_hash: None,
            countdown_secs: 5,
            wait_timeout_secs: None,
        }
    }
}

/// Complete configuration for provisioning and verification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    pub firmware: FirmwareConfig,
    pub log: LogConfig,
    pub verifiers: VerifierKeys,
    pub device: DeviceConfig,
    pub options: ProvisionOptions,
}

impl ProvisionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: ProvisionConfig =
            toml::from_str(&content).with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject combinations that cannot work before touching a device.
    pub fn validate(&self) -> Result<()> {
        if self.log.origin.is_empty() {
            bail!("log.origin is not set");
        }
        if self.log.verifier.is_empty() {
            bail!("log.verifier is not set");
        }
        for component in Component::ALL {
            let keys = self.verifiers.get(component);
            if keys.is_empty() {
                bail!("No manifest verifier keys configured for {component}");
            }
            if let Some((i, key)) = keys.iter().enumerate().find(|&(i, k)| keys[..i].contains(k)) {
                bail!("Manifest verifier key {i} for {component} is listed twice: {key}");
            }
        }
        if self.options.fuse && self.options.expected_srk_hash.is_none() {
            bail!("Fusing requires options.expected_srk_hash");
        }
        Ok(())
    }

    pub fn log_verifier(&self) -> Result<Arc<dyn NoteVerifier>> {
        let v = Ed25519Verifier::from_key(&self.log.verifier).context("Invalid log verifier key")?;
        Ok(Arc::new(v))
    }

    /// One bundle verifier per component, from the configured keys.
    pub fn verifier_set(&self) -> Result<VerifierSet> {
        let log_verifier = self.log_verifier()?;
        let build = |component: Component| -> Result<BundleVerifier> {
            let mut keys: Vec<Arc<dyn NoteVerifier>> = Vec::new();
            for key in self.verifiers.get(component) {
                let v = Ed25519Verifier::from_key(key)
                    .with_context(|| format!("Invalid {component} verifier key"))?;
                keys.push(Arc::new(v));
            }
            Ok(BundleVerifier::new(
                component,
                &self.log.origin,
                log_verifier.clone(),
                keys,
            ))
        };

        Ok(VerifierSet {
            recovery: build(Component::Recovery)?,
            bootloader: build(Component::Bootloader)?,
            os: build(Component::TrustedOs)?,
            applet: build(Component::TrustedApplet)?,
        })
    }

    /// Tracker for the configured log, seeded from the state file if present.
    pub fn log_tracker(&self) -> Result<LogStateTracker> {
        let fetcher = Arc::new(DirFetcher::new(&self.log.root));
        LogStateTracker::from_state_file(fetcher, &self.log.origin, self.log_verifier()?, &self.log.state_file)
            .context("Failed to initialise log state")
    }

    pub fn bundle_fetcher(&self) -> DirectoryBundleFetcher {
        let f = &self.firmware;
        [
            (Component::Recovery, &f.recovery),
            (Component::Bootloader, &f.bootloader),
            (Component::TrustedOs, &f.os),
            (Component::TrustedApplet, &f.applet),
        ]
        .into_iter()
        .fold(DirectoryBundleFetcher::new(), |fetcher, (component, path)| match path {
            Some(path) => fetcher.with_descriptor(component, path),
            None => fetcher,
        })
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.options.wait_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::Ed25519Signer;
    use tempfile::TempDir;

    fn keyed_config() -> ProvisionConfig {
        let log = Ed25519Signer::generate("example.com/log").unwrap();
        let release = Ed25519Signer::generate("release").unwrap();
        let cosigner = Ed25519Signer::generate("release-cosigner").unwrap();
        let key = release.verifier().to_key();
        ProvisionConfig {
            log: LogConfig {
                origin: "example.com/log".into(),
                verifier: log.verifier().to_key(),
                ..Default::default()
            },
            verifiers: VerifierKeys {
                recovery: vec![key.clone()],
                bootloader: vec![key.clone()],
                os: vec![key.clone(), cosigner.verifier().to_key()],
                applet: vec![key],
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = ProvisionConfig::default();
        assert_eq!(config.device.block_device_glob, "/dev/sd*");
        assert_eq!(config.device.settle(), Duration::from_secs(5));
        assert_eq!(config.device.hid_timeout(), Duration::from_secs(10));
        assert_eq!(config.device.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.options.countdown_secs, 5);
        assert!(!config.options.fuse);
        assert!(config.wait_timeout().is_none());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ProvisionConfig = toml::from_str(
            r#"
            [log]
            origin = "example.com/log"

            [options]
            fuse = true
            expected_srk_hash = "abcd"

            [device.operational]
            vendor_id = 0x1209
            product_ids = [0x2702, 0x2703]
            usage_page = 0xF1D0
            "#,
        )
        .unwrap();
        assert_eq!(config.log.origin, "example.com/log");
        assert_eq!(config.log.state_file, PathBuf::from("witness-log.state"));
        assert!(config.options.fuse);
        assert_eq!(config.options.countdown_secs, 5);
        assert_eq!(config.device.operational.product_ids, vec![0x2702, 0x2703]);
        assert_eq!(config.device.recovery, PersonaFilter::recovery());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("witness.toml");
        let mut config = keyed_config();
        config.firmware.os = Some(PathBuf::from("bundles/os.json"));
        config.options.wait_timeout_secs = Some(600);

        config.save_to_file(&path).unwrap();
        let loaded = ProvisionConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_validate() {
        let config = keyed_config();
        config.validate().unwrap();

        let mut fusing = config.clone();
        fusing.options.fuse = true;
        assert!(fusing.validate().is_err());
        fusing.options.expected_srk_hash = Some("00".repeat(32));
        fusing.validate().unwrap();

        let mut unsigned = config.clone();
        unsigned.verifiers.applet.clear();
        let err = unsigned.validate().unwrap_err();
        assert!(err.to_string().contains("trusted applet"));

        let mut repeated = config.clone();
        repeated.verifiers.os[1] = repeated.verifiers.os[0].clone();
        let err = repeated.validate().unwrap_err();
        assert!(err.to_string().contains("listed twice"));

        assert!(ProvisionConfig::default().validate().is_err());
    }

    #[test]
    fn test_verifier_set_from_keys() {
        let config = keyed_config();
        let set = config.verifier_set().unwrap();
        assert_eq!(set.get(Component::TrustedOs).component(), Component::TrustedOs);

        let mut bad = config;
        bad.verifiers.os[1] = "not-a-key".into();
        let err = bad.verifier_set().err().unwrap();
        assert!(format!("{err:#}").contains("trusted OS"));
    }
}
