//! Shared helpers: a release directory on disk (log, bundles, config) and a
//! simulated device backed by an image file.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use witness_core::bundle::{BundleDescriptor, Component};
use witness_core::config::ProvisionConfig;
use witness_core::events::{ProvisionEvent, ProvisionObserver};
use witness_core::flash::{FlashJob, MmcFlasher};
use witness_core::log::note::sign_note;
use witness_core::log::{Ed25519Signer, MemoryLog, NoteSigner};
use witness_core::protocol::DeviceStatus;
use witness_core::provision::backend::read_block_device;
use witness_core::provision::{DeviceBackend, OperationalDevice};
use witness_core::verify::FirmwareRelease;

pub const ORIGIN: &str = "transparency.dev/armored-witness/firmware";
pub const SRK_HASH: &str = "b8ba457320663bf006accd3c57e06720e63b21ce5351cb91b4650690bb08d85a";

/// What gets published for one component.
pub struct ComponentPlan {
    pub size: usize,
    pub signers: Vec<Ed25519Signer>,
    /// Unrelated log entries appended just before the manifest.
    pub preceding_entries: usize,
}

impl ComponentPlan {
    pub fn new(size: usize, signers: &[&Ed25519Signer]) -> Self {
        Self {
            size,
            signers: signers.iter().map(|s| (*s).clone()).collect(),
            preceding_entries: 0,
        }
    }

    pub fn after_entries(mut self, entries: usize) -> Self {
        self.preceding_entries = entries;
        self
    }
}

/// Layout of a release and its log.
pub struct ReleasePlan {
    pub recovery: ComponentPlan,
    pub bootloader: ComponentPlan,
    pub os: ComponentPlan,
    pub applet: ComponentPlan,
    /// Unrelated entries appended after the last manifest.
    pub trailing_entries: usize,
}

impl ReleasePlan {
    /// 1000 byte images, all signed by `signer`, in a four entry log.
    pub fn uniform(signer: &Ed25519Signer) -> Self {
        Self {
            recovery: ComponentPlan::new(1000, &[signer]),
            bootloader: ComponentPlan::new(1000, &[signer]),
            os: ComponentPlan::new(1000, &[signer]),
            applet: ComponentPlan::new(1000, &[signer]),
            trailing_entries: 0,
        }
    }

    fn get(&self, component: Component) -> &ComponentPlan {
        match component {
            Component::Recovery => &self.recovery,
            Component::Bootloader => &self.bootloader,
            Component::TrustedOs => &self.os,
            Component::TrustedApplet => &self.applet,
        }
    }
}

/// A release published to a log on disk, with one bundle descriptor per
/// component and a config pointing at all of it.
pub struct Release {
    pub dir: TempDir,
    pub log: MemoryLog,
    pub config: ProvisionConfig,
}

impl Release {
    pub fn new() -> Self {
        let signer = Ed25519Signer::generate("armored-witness-release").unwrap();
        Self::publish(&ReleasePlan::uniform(&signer))
    }

    pub fn publish(plan: &ReleasePlan) -> Self {
        let dir = TempDir::new().unwrap();
        let mut log = MemoryLog::new(ORIGIN).unwrap();

        let mut entries = Vec::new();
        for (i, component) in Component::ALL.into_iter().enumerate() {
            let part = plan.get(component);
            for n in 0..part.preceding_entries {
                log.append(format!("other release {component} {n}\n").as_bytes());
            }
            let firmware: Vec<u8> = (0..part.size).map(|b| (b as u8).wrapping_mul(i as u8 + 3)).collect();
            let manifest = release_note(&part.signers, component, "v0.3.1", &firmware);
            let index = log.append(&manifest);
            entries.push((component, firmware, manifest, index));
        }
        for n in 0..plan.trailing_entries {
            log.append(format!("later release {n}\n").as_bytes());
        }
        let checkpoint = log.publish().unwrap();
        log.write_to_dir(&dir.path().join("log")).unwrap();

        let mut config = ProvisionConfig::default();
        config.log.origin = ORIGIN.into();
        config.log.verifier = log.signer().verifier().to_key();
        config.log.root = dir.path().join("log");
        config.log.state_file = dir.path().join("state").join("log.checkpoint");
        config.options.countdown_secs = 0;

        let bundles = dir.path().join("bundles");
        std::fs::create_dir_all(&bundles).unwrap();
        std::fs::write(bundles.join("checkpoint"), &checkpoint.raw).unwrap();
        for (component, firmware, manifest, index) in entries {
            let name = descriptor_name(component);
            std::fs::write(bundles.join(format!("{name}.bin")), &firmware).unwrap();
            std::fs::write(bundles.join(format!("{name}.manifest")), &manifest).unwrap();
            let mut hab_signature = None;
            if component == Component::Recovery {
                std::fs::write(bundles.join("recovery.sig"), [0xC3; 16]).unwrap();
                hab_signature = Some(PathBuf::from("recovery.sig"));
            }
            let descriptor = BundleDescriptor {
                component,
                firmware: format!("{name}.bin").into(),
                hab_signature,
                manifest: format!("{name}.manifest").into(),
                checkpoint: "checkpoint".into(),
                log_index: index,
                inclusion_proof: log
                    .inclusion_proof(index, checkpoint.size)
                    .unwrap()
                    .iter()
                    .map(|h| STANDARD.encode(h))
                    .collect(),
            };
            let path = bundles.join(format!("{name}.json"));
            std::fs::write(&path, serde_json::to_string_pretty(&descriptor).unwrap()).unwrap();

            let keys: Vec<String> = plan
                .get(component)
                .signers
                .iter()
                .map(|s| s.verifier().to_key())
                .collect();
            match component {
                Component::Recovery => {
                    config.firmware.recovery = Some(path);
                    config.verifiers.recovery = keys;
                }
                Component::Bootloader => {
                    config.firmware.bootloader = Some(path);
                    config.verifiers.bootloader = keys;
                }
                Component::TrustedOs => {
                    config.firmware.os = Some(path);
                    config.verifiers.os = keys;
                }
                Component::TrustedApplet => {
                    config.firmware.applet = Some(path);
                    config.verifiers.applet = keys;
                }
            }
        }

        Self { dir, log, config }
    }

    /// Append unrelated entries and republish the log directory.
    pub fn grow_log(&mut self, entries: usize) {
        for i in 0..entries {
            self.log.append(format!("unrelated entry {i}\n").as_bytes());
        }
        self.log.publish().unwrap();
        self.log.write_to_dir(&self.config.log.root).unwrap();
    }

    /// Replace the log directory with a different tree of `size` leaves
    /// signed with the genuine log key.
    pub fn fork_log(&mut self, size: usize) {
        let mut forged = MemoryLog::with_signer(ORIGIN, self.log.signer().clone());
        for i in 0..size {
            forged.append(format!("forged entry {i}\n").as_bytes());
        }
        forged.publish().unwrap();
        std::fs::remove_dir_all(&self.config.log.root).unwrap();
        forged.write_to_dir(&self.config.log.root).unwrap();
    }

    pub fn image_path(&self) -> PathBuf {
        self.dir.path().join("mmc.img")
    }
}

fn descriptor_name(component: Component) -> &'static str {
    match component {
        Component::Recovery => "recovery",
        Component::Bootloader => "bootloader",
        Component::TrustedOs => "trusted_os",
        Component::TrustedApplet => "trusted_applet",
    }
}

fn release_note(signers: &[Ed25519Signer], component: Component, tag: &str, firmware: &[u8]) -> Vec<u8> {
    let release = FirmwareRelease {
        component,
        git_tag_name: tag.into(),
        git_commit_fingerprint: "7a6a5b8e3d0c1f2e4b9a8c7d6e5f4a3b2c1d0e9f".into(),
        firmware_digest_sha256: Sha256::digest(firmware).to_vec(),
        tamago_version: "1.22.6".into(),
        hab: None,
    };
    let signers: Vec<&dyn NoteSigner> = signers.iter().map(|s| s as &dyn NoteSigner).collect();
    sign_note(&release.to_note_text().unwrap(), &signers).unwrap()
}

/// Collects every event a session emits.
#[derive(Default)]
pub struct EventLog(Mutex<Vec<ProvisionEvent>>);

impl ProvisionObserver for EventLog {
    fn on_event(&self, event: &ProvisionEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

impl EventLog {
    pub fn events(&self) -> Vec<ProvisionEvent> {
        self.0.lock().unwrap().clone()
    }
}

/// Operational firmware answering with a shared status.
pub struct SimulatedFirmware {
    status: Arc<Mutex<DeviceStatus>>,
}

impl OperationalDevice for SimulatedFirmware {
    fn path(&self) -> String {
        "sim:u2f".to_string()
    }

    fn status(&mut self) -> Result<DeviceStatus> {
        Ok(self.status.lock().unwrap().clone())
    }

    fn activate_hab(&mut self) -> Result<()> {
        let mut status = self.status.lock().unwrap();
        if status.hab {
            bail!("HAB already active");
        }
        status.hab = true;
        Ok(())
    }
}

/// A device whose MMC is an image file.
pub struct SimulatedDevice {
    pub image: PathBuf,
    pub boots: Vec<Vec<u8>>,
    pub flashed: Vec<String>,
    /// Start block of every flashed job, in write order.
    pub flashed_blocks: Vec<u64>,
    pub status: Arc<Mutex<DeviceStatus>>,
    flasher: MmcFlasher,
}

impl SimulatedDevice {
    /// A blank device.
    pub fn new(image: &Path) -> Self {
        std::fs::File::create(image).unwrap();
        Self::reopen(image)
    }

    /// The device behind an existing image.
    pub fn reopen(image: &Path) -> Self {
        Self {
            image: image.to_path_buf(),
            boots: Vec::new(),
            flashed: Vec::new(),
            flashed_blocks: Vec::new(),
            status: Arc::new(Mutex::new(DeviceStatus {
                serial: "3C2A1F0E".into(),
                revision: "1".into(),
                version: "v0.3.1".into(),
                identity: "ArmoredWitness-3C2A1F0E+8f3b2c1a+AWxvZw==".into(),
                srk_hash: SRK_HASH.into(),
                ..Default::default()
            })),
            flasher: MmcFlasher::new(),
        }
    }
}

impl DeviceBackend for SimulatedDevice {
    fn boot_recovery(&mut self, image: &[u8], cancel: &CancellationToken) -> Result<PathBuf> {
        if cancel.is_cancelled() {
            bail!("cancelled");
        }
        self.boots.push(image.to_vec());
        Ok(self.image.clone())
    }

    fn flash(&mut self, device: &Path, jobs: &[FlashJob]) -> Result<()> {
        self.flashed.extend(jobs.iter().map(|j| j.label.clone()));
        self.flashed_blocks.extend(jobs.iter().map(|j| j.start_block));
        Ok(self.flasher.flash(device, jobs)?)
    }

    fn wipe(
        &mut self,
        _device: &Path,
        _start_block: u64,
        blocks: u64,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<()> {
        on_progress(blocks, blocks);
        Ok(())
    }

    fn read_at(&mut self, device: &Path, offset: u64, len: usize) -> Result<Vec<u8>> {
        read_block_device(device, offset, len)
    }

    fn wait_for_operational(&mut self, _cancel: &CancellationToken) -> Result<Box<dyn OperationalDevice>> {
        Ok(Box::new(SimulatedFirmware {
            status: self.status.clone(),
        }))
    }
}
