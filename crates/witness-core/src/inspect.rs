//! Verification of the firmware installed on a device.
//!
//! The device is booted into recovery, each component's config block is read
//! back off the MMC together with the firmware it describes, and every bundle
//! is checked the same way a fresh one would be before provisioning.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::bundle::{Component, FirmwareBundle};
use crate::detect::{WaitScope, sleep_cancellable};
use crate::events::{Persona, ProvisionEvent, ProvisionObserver, TracingObserver};
use crate::layout::{
    APPLET_BLOCK, BOOTLOADER_CONFIG_BLOCK, CONFIG_MAX_LENGTH, ConfigBlock, OS_BLOCK, block_offset,
};
use crate::log::LogStateTracker;
use crate::provision::DeviceBackend;
use crate::verify::VerifierSet;

/// Attempts at reading the MMC; the block device can lag behind its node.
pub const EXTRACT_ATTEMPTS: usize = 2;
pub const EXTRACT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Components read back off the MMC and where their config blocks live.
pub const INSTALLED: [(Component, u64); 3] = [
    (Component::Bootloader, BOOTLOADER_CONFIG_BLOCK),
    (Component::TrustedOs, OS_BLOCK),
    (Component::TrustedApplet, APPLET_BLOCK),
];

/// Firmware found on a device.
#[derive(Debug, Clone)]
pub struct InstalledFirmware {
    pub bundles: Vec<(Component, FirmwareBundle)>,
}

/// Verification outcome for one installed component.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentReport {
    pub component: Component,
    pub firmware_sha256: String,
    pub git_tag: Option<String>,
    pub checkpoint_size: Option<u64>,
    pub error: Option<String>,
}

impl ComponentReport {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

/// Read the config block stored at `block`.
pub fn read_config_block(backend: &mut dyn DeviceBackend, device: &Path, block: u64) -> Result<ConfigBlock> {
    let raw = backend
        .read_at(device, block_offset(block), CONFIG_MAX_LENGTH)
        .with_context(|| format!("Failed to read config region at block 0x{block:X}"))?;
    ConfigBlock::decode(&raw).with_context(|| format!("Failed to decode config at block 0x{block:X}"))
}

/// Read a component's config block and the firmware it points at.
pub fn read_firmware(backend: &mut dyn DeviceBackend, device: &Path, block: u64) -> Result<FirmwareBundle> {
    let config = read_config_block(backend, device, block)?;
    info!(block = %format!("0x{:X}", block), "Found config");
    debug!(
        offset = %format!("0x{:X}", config.offset),
        size = config.size,
        log_index = config.bundle.log_index,
        "Reading firmware"
    );
    let size = usize::try_from(config.size).map_err(|_| anyhow!("Firmware size {} too large", config.size))?;
    let firmware = backend
        .read_at(device, config.offset, size)
        .context("Failed to read firmware data")?;
    Ok(FirmwareBundle::from_parts(firmware, config.bundle))
}

/// Read every installed component from the device.
pub fn extract_firmware(backend: &mut dyn DeviceBackend, device: &Path) -> Result<InstalledFirmware> {
    let mut bundles = Vec::with_capacity(INSTALLED.len());
    for (component, block) in INSTALLED {
        let bundle = read_firmware(backend, device, block).with_context(|| format!("Failed to read {component}"))?;
        bundles.push((component, bundle));
    }
    Ok(InstalledFirmware { bundles })
}

/// Checks the firmware installed on a device against the firmware log.
pub struct DeviceVerifier<B: DeviceBackend, O: ProvisionObserver> {
    verifiers: VerifierSet,
    tracker: LogStateTracker,
    state_file: PathBuf,
    backend: B,
    observer: Arc<O>,
    cancel: CancellationToken,
    wait_timeout: Option<Duration>,
}

impl<B: DeviceBackend> DeviceVerifier<B, TracingObserver> {
    pub fn new(verifiers: VerifierSet, tracker: LogStateTracker, state_file: impl Into<PathBuf>, backend: B) -> Self {
        Self::with_observer(verifiers, tracker, state_file, backend, Arc::new(TracingObserver))
    }
}

impl<B: DeviceBackend, O: ProvisionObserver> DeviceVerifier<B, O> {
    pub fn with_observer(
        verifiers: VerifierSet,
        tracker: LogStateTracker,
        state_file: impl Into<PathBuf>,
        backend: B,
        observer: Arc<O>,
    ) -> Self {
        Self {
            verifiers,
            tracker,
            state_file: state_file.into(),
            backend,
            observer,
            cancel: CancellationToken::new(),
            wait_timeout: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn tracker(&self) -> &LogStateTracker {
        &self.tracker
    }

    fn emit(&self, event: ProvisionEvent) {
        self.observer.on_event(&event);
    }

    fn milestone(&self, name: String, passed: bool) {
        self.emit(ProvisionEvent::Milestone { name, passed });
    }

    /// Boot `recovery` on the attached device and verify what it has installed.
    ///
    /// Bundles that are not self-consistent are reported and the rest are
    /// still checked; a checkpoint inconsistent with the log stops the run.
    #[instrument(skip_all)]
    pub fn verify_device(&mut self, recovery: &FirmwareBundle) -> Result<Vec<ComponentReport>> {
        self.verifiers
            .recovery
            .verify_self_consistency(recovery)
            .context("Recovery image failed verification")?;
        self.milestone("Recovery image verified".to_string(), true);
        info!(
            firmware = recovery.firmware.len(),
            hab_signature = recovery.hab_signature.as_ref().map_or(0, |s| s.len()),
            "Recovery image ready"
        );

        self.emit(ProvisionEvent::Prompt {
            message: "Set the boot switch to USB, then connect the device".to_string(),
        });
        let scope = WaitScope::new(&self.cancel, self.wait_timeout);
        let device = self
            .backend
            .boot_recovery(&recovery.signed_image(), scope.token())
            .map_err(|e| scope.explain(e, "the recovery device"))?;
        drop(scope);
        self.emit(ProvisionEvent::DeviceDetected {
            persona: Persona::MassStorage,
            path: device.display().to_string(),
        });

        let installed = self.extract_with_retry(&device)?;
        let reports = self.verify_installed(&installed)?;

        self.tracker
            .save(&self.state_file)
            .context("Failed to save log state")?;

        let failed: Vec<String> = reports
            .iter()
            .filter_map(|r| r.error.as_ref().map(|e| format!("{}: {e}", r.component)))
            .collect();
        if !failed.is_empty() {
            bail!("Device firmware failed verification: {}", failed.join("; "));
        }

        self.emit(ProvisionEvent::Prompt {
            message: "Set the boot switch to MMC, then reboot the device".to_string(),
        });
        Ok(reports)
    }

    fn extract_with_retry(&mut self, device: &Path) -> Result<InstalledFirmware> {
        let mut last = None;
        for attempt in 1..=EXTRACT_ATTEMPTS {
            match extract_firmware(&mut self.backend, device) {
                Ok(installed) => return Ok(installed),
                Err(e) => {
                    warn!(attempt, error = %format!("{e:#}"), "Failed to extract firmware");
                    last = Some(e);
                    if attempt < EXTRACT_ATTEMPTS {
                        sleep_cancellable(EXTRACT_RETRY_DELAY, &self.cancel)?;
                    }
                }
            }
        }
        let err = last.unwrap_or_else(|| anyhow!("No extraction attempted"));
        Err(err.context(format!("Failed to extract firmware after {EXTRACT_ATTEMPTS} attempts")))
    }

    /// Verify installed bundles; only log inconsistency is fatal.
    pub fn verify_installed(&mut self, installed: &InstalledFirmware) -> Result<Vec<ComponentReport>> {
        let mut reports = Vec::with_capacity(installed.bundles.len());
        for (component, bundle) in &installed.bundles {
            let verifier = self.verifiers.get(*component);
            let mut report = ComponentReport {
                component: *component,
                firmware_sha256: hex::encode(bundle.firmware_digest()),
                git_tag: None,
                checkpoint_size: None,
                error: None,
            };
            debug!(component = %component, sha256 = %report.firmware_sha256, "Extracted firmware");

            match verifier.verify_self_consistency(bundle) {
                Ok(verified) => {
                    report.git_tag = Some(verified.release.git_tag_name);
                    report.checkpoint_size = Some(verified.checkpoint.size);
                    self.milestone(format!("{component} proof bundle is self-consistent"), true);
                }
                Err(e) => {
                    warn!(component = %component, error = %e, "Bundle failed verification");
                    self.milestone(format!("{component} proof bundle is self-consistent"), false);
                    report.error = Some(e.to_string());
                    reports.push(report);
                    continue;
                }
            }

            verifier
                .verify_against_current_log(bundle, &mut self.tracker)
                .with_context(|| format!("{component} checkpoint is not consistent with the log"))?;
            self.milestone(
                format!(
                    "{component} checkpoint consistent with log at {}",
                    self.tracker.latest().size
                ),
                true,
            );
            reports.push(report);
        }
        Ok(reports)
    }
}
