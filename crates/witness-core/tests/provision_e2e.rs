//! Provisioning runs against a simulated device, driven by a release laid
//! out on disk the way the CLI sees it.

mod common;

use std::sync::Arc;

use common::{ComponentPlan, EventLog, Release, ReleasePlan, SRK_HASH, SimulatedDevice};
use witness_core::bundle::{BundleFetcher, Component, FirmwareSet};
use witness_core::config::ProvisionConfig;
use witness_core::events::ProvisionEvent;
use witness_core::inspect::DeviceVerifier;
use witness_core::layout::{
    APPLET_BLOCK, BOOTLOADER_BLOCK, BOOTLOADER_CONFIG_BLOCK, CONFIG_MAX_LENGTH, ConfigBlock, OS_BLOCK,
    block_offset, firmware_offset,
};
use witness_core::log::Ed25519Signer;
use witness_core::provision::backend::read_block_device;
use witness_core::provision::{ProvisionSession, ProvisionState};

fn provision(
    config: &ProvisionConfig,
    device: SimulatedDevice,
) -> (ProvisionSession<SimulatedDevice, EventLog>, Arc<EventLog>) {
    config.validate().unwrap();
    let firmware = FirmwareSet::fetch(&config.bundle_fetcher()).unwrap();
    let events = Arc::new(EventLog::default());
    let session = ProvisionSession::with_observer(
        config.clone(),
        firmware,
        config.verifier_set().unwrap(),
        config.log_tracker().unwrap(),
        device,
        events.clone(),
    );
    (session, events)
}

#[test]
fn test_provision_then_verify() {
    let release = Release::new();
    let config = &release.config;
    let firmware = FirmwareSet::fetch(&config.bundle_fetcher()).unwrap();

    let (mut session, events) = provision(config, SimulatedDevice::new(&release.image_path()));
    let report = session.run().unwrap();

    assert_eq!(
        report.history,
        vec![
            ProvisionState::Init,
            ProvisionState::RecoveryBoot,
            ProvisionState::Flashing,
            ProvisionState::AwaitingOperational,
            ProvisionState::StatusCheck,
            ProvisionState::Done,
        ]
    );
    assert!(!report.history.iter().any(|s| s.is_fuse_stage()));
    assert!(!report.fused);
    assert!(config.log.state_file.exists());

    let device = session.backend();
    assert_eq!(device.boots, vec![firmware.recovery.firmware.clone()]);
    assert_eq!(
        device.flashed,
        vec!["bootloader", "bootloader config", "trusted OS", "trusted applet"]
    );
    let bootloader = read_block_device(
        &device.image,
        block_offset(BOOTLOADER_BLOCK),
        firmware.bootloader.firmware.len(),
    )
    .unwrap();
    assert_eq!(bootloader, firmware.bootloader.firmware);
    let applet = read_block_device(
        &device.image,
        firmware_offset(APPLET_BLOCK),
        firmware.applet.firmware.len(),
    )
    .unwrap();
    assert_eq!(applet, firmware.applet.firmware);

    assert!(events.events().contains(&ProvisionEvent::Complete {
        serial: "3C2A1F0E".into(),
        identity: "ArmoredWitness-3C2A1F0E+8f3b2c1a+AWxvZw==".into(),
    }));

    // the same workstation verifies what it just wrote
    let mut verifier = DeviceVerifier::new(
        config.verifier_set().unwrap(),
        config.log_tracker().unwrap(),
        &config.log.state_file,
        SimulatedDevice::reopen(&device.image),
    );
    let reports = verifier.verify_device(&firmware.recovery).unwrap();
    assert_eq!(reports.len(), 3);
    assert!(reports.iter().all(|r| r.passed()));
    assert!(reports.iter().all(|r| r.git_tag.as_deref() == Some("v0.3.1")));
}

#[test]
fn test_release_flashes_fixed_locations() {
    let release_key = Ed25519Signer::generate("armored-witness-release").unwrap();
    let cosigner = Ed25519Signer::generate("armored-witness-cosigner").unwrap();
    // recovery at 0, bootloader at 1, OS at 5, applet at 6, in a 10 entry log
    let release = Release::publish(&ReleasePlan {
        recovery: ComponentPlan::new(1000, &[&release_key]),
        bootloader: ComponentPlan::new(4096, &[&release_key]),
        os: ComponentPlan::new(2 << 20, &[&release_key, &cosigner]).after_entries(3),
        applet: ComponentPlan::new(1 << 20, &[&release_key]),
        trailing_entries: 3,
    });
    let mut config = release.config.clone();
    config.options.expected_srk_hash = Some(SRK_HASH.into());
    assert_eq!(config.verifiers.os.len(), 2);

    let firmware = FirmwareSet::fetch(&config.bundle_fetcher()).unwrap();
    assert_eq!(release.log.size(), 10);
    assert_eq!(firmware.os.log_index, 5);
    assert_eq!(firmware.applet.log_index, 6);

    let (mut session, _) = provision(&config, SimulatedDevice::new(&release.image_path()));
    let report = session.run().unwrap();

    assert_eq!(report.history.last(), Some(&ProvisionState::Done));
    assert!(!report.history.iter().any(|s| s.is_fuse_stage()));
    assert!(!report.fused);
    assert!(report.warnings.is_empty());
    assert!(report.status.srk_hash.eq_ignore_ascii_case(SRK_HASH));

    let device = session.backend();
    assert_eq!(
        device.flashed_blocks,
        vec![BOOTLOADER_BLOCK, BOOTLOADER_CONFIG_BLOCK, OS_BLOCK, APPLET_BLOCK]
    );

    let bootloader = read_block_device(&device.image, block_offset(BOOTLOADER_BLOCK), 4096).unwrap();
    assert_eq!(bootloader, firmware.bootloader.firmware);
    let raw = read_block_device(
        &device.image,
        block_offset(BOOTLOADER_CONFIG_BLOCK),
        CONFIG_MAX_LENGTH,
    )
    .unwrap();
    let config_block = ConfigBlock::decode(&raw).unwrap();
    assert_eq!(config_block.offset, block_offset(BOOTLOADER_BLOCK));
    assert_eq!(config_block.size, 4096);
    assert_eq!(config_block.bundle.log_index, 1);

    let raw = read_block_device(&device.image, block_offset(OS_BLOCK), CONFIG_MAX_LENGTH).unwrap();
    let os_config = ConfigBlock::decode(&raw).unwrap();
    assert_eq!(os_config.offset, firmware_offset(OS_BLOCK));
    assert_eq!(os_config.size, 2 << 20);
    assert_eq!(os_config.bundle.log_index, 5);
    let os = read_block_device(&device.image, firmware_offset(OS_BLOCK), 2 << 20).unwrap();
    assert_eq!(os, firmware.os.firmware);

    let applet = read_block_device(&device.image, firmware_offset(APPLET_BLOCK), 1 << 20).unwrap();
    assert_eq!(applet, firmware.applet.firmware);
}

#[test]
fn test_fusing_run_boots_signed_recovery_and_fuses() {
    let release = Release::new();
    let mut config = release.config.clone();
    config.options.fuse = true;
    config.options.expected_srk_hash = Some(SRK_HASH.to_uppercase());
    let firmware = FirmwareSet::fetch(&config.bundle_fetcher()).unwrap();

    let (mut session, events) = provision(&config, SimulatedDevice::new(&release.image_path()));
    let report = session.run().unwrap();

    assert_eq!(
        report.history,
        vec![
            ProvisionState::Init,
            ProvisionState::RecoveryBoot,
            ProvisionState::Flashing,
            ProvisionState::AwaitingOperational,
            ProvisionState::StatusCheck,
            ProvisionState::FuseBoot,
            ProvisionState::FuseFlash,
            ProvisionState::Done,
        ]
    );
    assert!(report.fused);
    assert!(report.status.hab);
    assert!(report.warnings.is_empty());

    let device = session.backend();
    assert_eq!(
        device.boots,
        vec![firmware.recovery.signed_image(), firmware.recovery.signed_image()]
    );
    assert_eq!(device.flashed.last().map(String::as_str), Some("trusted applet"));
    let applet = read_block_device(
        &device.image,
        firmware_offset(APPLET_BLOCK),
        firmware.applet.firmware.len(),
    )
    .unwrap();
    assert_eq!(applet, firmware.applet.firmware);
    assert!(
        events
            .events()
            .iter()
            .any(|e| matches!(e, ProvisionEvent::Milestone { passed: true, .. }))
    );
}

#[test]
fn test_fusing_refused_on_srk_mismatch() {
    let release = Release::new();
    let mut config = release.config.clone();
    config.options.fuse = true;
    config.options.expected_srk_hash = Some("00".repeat(32));

    let (mut session, _) = provision(&config, SimulatedDevice::new(&release.image_path()));
    let err = session.run().unwrap_err();

    assert_eq!(session.state(), ProvisionState::Failed);
    assert!(format!("{err:#}").contains("STATUS_CHECK"));
    assert!(!session.backend().status.lock().unwrap().hab);
    assert!(!session.history().contains(&ProvisionState::FuseBoot));
}

#[test]
fn test_bundle_with_unknown_signer_stops_before_device() {
    let release = Release::new();
    let mut config = release.config.clone();
    let other = witness_core::log::Ed25519Signer::generate("someone-else").unwrap();
    config.verifiers.os = vec![other.verifier().to_key()];
    assert!(config.bundle_fetcher().fetch(Component::TrustedOs).is_ok());

    let (mut session, _) = provision(&config, SimulatedDevice::new(&release.image_path()));
    let err = session.run().unwrap_err();

    assert!(format!("{err:#}").contains("trusted OS"));
    assert_eq!(session.history(), &[ProvisionState::Init, ProvisionState::Failed]);
    assert!(session.backend().boots.is_empty());
    assert!(session.backend().flashed.is_empty());
}
