//! Provisioning session: drives one device from blank to provisioned.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::backend::{DeviceBackend, OperationalDevice};
use super::jobs::{applet_job, flash_jobs};
use super::state::ProvisionState;
use crate::bundle::{Component, FirmwareSet};
use crate::config::ProvisionConfig;
use crate::detect::{WaitScope, sleep_cancellable};
use crate::events::{LogLevel, Persona, ProvisionEvent, ProvisionObserver, TracingObserver};
use crate::layout::{APPLET_DATA_END_BLOCK, APPLET_DATA_START_BLOCK};
use crate::log::LogStateTracker;
use crate::protocol::DeviceStatus;
use crate::verify::VerifierSet;

/// Outcome of a safety check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyCheck {
    Passed,
    /// Failed, but the operator chose to continue.
    Overridden(String),
}

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct ProvisionReport {
    pub status: DeviceStatus,
    pub fused: bool,
    pub warnings: Vec<String>,
    pub history: Vec<ProvisionState>,
}

/// One provisioning run.
pub struct ProvisionSession<B: DeviceBackend, O: ProvisionObserver> {
    config: ProvisionConfig,
    firmware: FirmwareSet,
    verifiers: VerifierSet,
    tracker: LogStateTracker,
    backend: B,
    observer: Arc<O>,
    cancel: CancellationToken,

    state: ProvisionState,
    history: Vec<ProvisionState>,
    block_device: Option<PathBuf>,
    device: Option<Box<dyn OperationalDevice>>,
    status: Option<DeviceStatus>,
    warnings: Vec<String>,
}

impl<B: DeviceBackend> ProvisionSession<B, TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(
        config: ProvisionConfig,
        firmware: FirmwareSet,
        verifiers: VerifierSet,
        tracker: LogStateTracker,
        backend: B,
    ) -> Self {
        Self::with_observer(config, firmware, verifiers, tracker, backend, Arc::new(TracingObserver))
    }
}

impl<B: DeviceBackend, O: ProvisionObserver> ProvisionSession<B, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(
        config: ProvisionConfig,
        firmware: FirmwareSet,
        verifiers: VerifierSet,
        tracker: LogStateTracker,
        backend: B,
        observer: Arc<O>,
    ) -> Self {
        Self {
            config,
            firmware,
            verifiers,
            tracker,
            backend,
            observer,
            cancel: CancellationToken::new(),
            state: ProvisionState::Init,
            history: vec![ProvisionState::Init],
            block_device: None,
            device: None,
            status: None,
            warnings: Vec::new(),
        }
    }

    /// Use `cancel` to abort device waits from outside.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> ProvisionState {
        self.state
    }

    /// States visited so far, in order.
    pub fn history(&self) -> &[ProvisionState] {
        &self.history
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run to completion. On error the session ends in `Failed`; nothing is
    /// rolled back.
    #[instrument(skip(self), fields(fuse = self.config.options.fuse))]
    pub fn run(&mut self) -> Result<ProvisionReport> {
        loop {
            let current = self.state;
            match self.step() {
                // only Done steps to itself
                Ok(next) if next == current => break,
                Ok(next) => self.transition(next),
                Err(e) => {
                    self.emit(ProvisionEvent::Milestone {
                        name: current.to_string(),
                        passed: false,
                    });
                    self.log(LogLevel::Error, format!("{e:#}"));
                    self.transition(ProvisionState::Failed);
                    return Err(e.context(format!("Provisioning failed in {current}")));
                }
            }
        }

        let status = self
            .status
            .clone()
            .ok_or_else(|| anyhow!("Finished without a device status"))?;
        Ok(ProvisionReport {
            fused: status.hab,
            status,
            warnings: self.warnings.clone(),
            history: self.history.clone(),
        })
    }

    fn step(&mut self) -> Result<ProvisionState> {
        match self.state {
            ProvisionState::Init => self.init(),
            ProvisionState::RecoveryBoot => {
                self.boot_recovery()?;
                Ok(ProvisionState::Flashing)
            }
            ProvisionState::Flashing => self.flash_images(),
            ProvisionState::AwaitingOperational => {
                self.await_operational()?;
                Ok(ProvisionState::StatusCheck)
            }
            ProvisionState::StatusCheck => self.status_check(),
            ProvisionState::FuseBoot => {
                self.boot_recovery()?;
                Ok(ProvisionState::FuseFlash)
            }
            ProvisionState::FuseFlash => self.flash_applet(),
            ProvisionState::Done => self.finish(),
            ProvisionState::Failed => bail!("Session has already failed"),
        }
    }

    fn transition(&mut self, to: ProvisionState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.emit(ProvisionEvent::PhaseChanged { from, to });
        self.state = to;
        self.history.push(to);
    }

    fn emit(&self, event: ProvisionEvent) {
        self.observer.on_event(&event);
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(ProvisionEvent::Log {
            level,
            message: message.into(),
        });
    }

    fn prompt(&self, message: &str) {
        self.emit(ProvisionEvent::Prompt {
            message: message.to_string(),
        });
    }

    fn milestone(&self, name: impl Into<String>) {
        self.emit(ProvisionEvent::Milestone {
            name: name.into(),
            passed: true,
        });
    }

    fn warn(&mut self, message: String) {
        self.emit(ProvisionEvent::Warning {
            message: message.clone(),
        });
        self.warnings.push(message);
    }

    /// Pass, or continue with a warning when overrides are allowed.
    fn safety_check(&mut self, ok: bool, name: &str, failure: String) -> Result<SafetyCheck> {
        if ok {
            self.milestone(name);
            return Ok(SafetyCheck::Passed);
        }
        if !self.config.options.override_safety {
            bail!("{failure}");
        }
        let message = format!("{failure} (overridden)");
        self.warn(message.clone());
        Ok(SafetyCheck::Overridden(message))
    }

    fn countdown(&self, action: &str) -> Result<()> {
        for remaining in (1..=self.config.options.countdown_secs).rev() {
            self.emit(ProvisionEvent::Countdown {
                action: action.to_string(),
                remaining_secs: remaining,
            });
            sleep_cancellable(Duration::from_secs(1), &self.cancel)?;
        }
        Ok(())
    }

    fn wait_scope(&self) -> WaitScope {
        WaitScope::new(&self.cancel, self.config.wait_timeout())
    }

    fn init(&mut self) -> Result<ProvisionState> {
        if self.config.options.fuse && self.config.options.expected_srk_hash.is_none() {
            bail!("Fusing requires an expected SRK hash");
        }

        for component in Component::ALL {
            let bundle = self.firmware.get(component);
            let verifier = self.verifiers.get(component);
            let verified = verifier
                .verify_self_consistency(bundle)
                .with_context(|| format!("Invalid {component} bundle"))?;
            verifier
                .verify_against_current_log(bundle, &mut self.tracker)
                .with_context(|| format!("{component} bundle is not consistent with the log"))?;
            info!(
                component = %component,
                tag = %verified.release.git_tag_name,
                index = bundle.log_index,
                "Bundle verified"
            );
            self.milestone(format!("{component} bundle verified"));
        }
        self.tracker
            .save(&self.config.log.state_file)
            .context("Failed to save log state")?;

        self.prompt("Set the boot switch to USB, then connect the device");
        Ok(ProvisionState::RecoveryBoot)
    }

    fn boot_recovery(&mut self) -> Result<()> {
        let recovery = &self.firmware.recovery;
        let image = if self.config.options.fuse {
            recovery.signed_image()
        } else {
            recovery.firmware.clone()
        };

        let scope = self.wait_scope();
        let path = self
            .backend
            .boot_recovery(&image, scope.token())
            .map_err(|e| scope.explain(e, "the recovery device"))?;
        drop(scope);

        self.emit(ProvisionEvent::DeviceDetected {
            persona: Persona::MassStorage,
            path: path.display().to_string(),
        });
        self.block_device = Some(path);
        Ok(())
    }

    fn block_device(&self) -> Result<PathBuf> {
        self.block_device
            .clone()
            .ok_or_else(|| anyhow!("No block device detected"))
    }

    fn flash_images(&mut self) -> Result<ProvisionState> {
        let device = self.block_device()?;
        let jobs = flash_jobs(&self.firmware, self.config.options.fuse)?;

        self.countdown("Flashing")?;
        self.backend
            .flash(&device, &jobs)
            .with_context(|| format!("Failed to flash {}", device.display()))?;
        for job in &jobs {
            debug!(job = %job.label, block = %format!("0x{:X}", job.start_block), "Job written");
        }
        self.milestone("Flashed images");

        if self.config.options.wipe_applet_data {
            let blocks = APPLET_DATA_END_BLOCK - APPLET_DATA_START_BLOCK;
            let observer = self.observer.clone();
            self.backend
                .wipe(&device, APPLET_DATA_START_BLOCK, blocks, &mut |current, total| {
                    observer.on_event(&ProvisionEvent::Progress {
                        operation: "Wiping applet data".to_string(),
                        current,
                        total,
                    });
                })
                .context("Failed to wipe applet data")?;
            self.milestone("Wiped applet data");
        }

        self.prompt("Set the boot switch to MMC, then reboot the device");
        Ok(ProvisionState::AwaitingOperational)
    }

    fn await_operational(&mut self) -> Result<()> {
        let scope = self.wait_scope();
        let device = self
            .backend
            .wait_for_operational(scope.token())
            .map_err(|e| scope.explain(e, "the operational device"))?;
        drop(scope);

        self.emit(ProvisionEvent::DeviceDetected {
            persona: Persona::Operational,
            path: device.path(),
        });
        self.device = Some(device);
        Ok(())
    }

    fn query_status(&mut self) -> Result<DeviceStatus> {
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| anyhow!("No operational device"))?;
        let status = device.status().context("Failed to fetch device status")?;
        info!(
            serial = %status.serial,
            fused = status.hab,
            srk_hash = %status.srk_hash,
            identity = %status.identity,
            "Device status"
        );
        self.status = Some(status.clone());
        Ok(status)
    }

    fn status_check(&mut self) -> Result<ProvisionState> {
        let status = self.query_status()?;
        self.milestone(format!("Found device {}", status.serial));

        if !self.config.options.fuse {
            if status.hab {
                self.warn(format!("Device {} is already HAB fused", status.serial));
            }
            return Ok(ProvisionState::Done);
        }

        self.safety_check(
            !status.hab,
            "Device not yet fused",
            format!("Device {} is already HAB fused", status.serial),
        )?;
        let expected = self.config.options.expected_srk_hash.clone().unwrap_or_default();
        self.safety_check(
            status.srk_hash.eq_ignore_ascii_case(&expected),
            "SRK hash matches",
            format!(
                "Device {} SRK hash {} does not match expected {}",
                status.serial, status.srk_hash, expected
            ),
        )?;

        self.countdown("Fusing")?;
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| anyhow!("No operational device"))?;
        match device.activate_hab() {
            Ok(()) => self.milestone("HAB activated"),
            Err(e) => {
                self.safety_check(false, "HAB activated", format!("Failed to activate HAB: {e:#}"))?;
            }
        }

        // the device reboots into recovery for the real applet
        self.device = None;
        self.block_device = None;
        self.prompt("Set the boot switch to USB, then reboot the device");
        Ok(ProvisionState::FuseBoot)
    }

    fn flash_applet(&mut self) -> Result<ProvisionState> {
        let device = self.block_device()?;
        let job = applet_job(&self.firmware)?;

        self.countdown("Flashing applet")?;
        self.backend
            .flash(&device, std::slice::from_ref(&job))
            .with_context(|| format!("Failed to flash {}", device.display()))?;
        self.milestone("Flashed trusted applet");

        self.prompt("Set the boot switch to MMC, then reboot the device");
        Ok(ProvisionState::Done)
    }

    fn finish(&mut self) -> Result<ProvisionState> {
        if self.device.is_none() {
            self.await_operational()?;
        }
        let status = self.query_status()?;
        if self.config.options.fuse && !status.hab {
            self.warn(format!("Device {} does not report HAB fused", status.serial));
        }

        self.emit(ProvisionEvent::Complete {
            serial: status.serial.clone(),
            identity: status.identity.clone(),
        });
        Ok(ProvisionState::Done)
    }
}
