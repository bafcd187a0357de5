//! Verifying a provisioned device while the log moves on underneath it.

mod common;

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use common::{Release, SimulatedDevice};
use witness_core::bundle::{BundleFetcher, Component, FirmwareSet};
use witness_core::flash::MmcFlasher;
use witness_core::inspect::DeviceVerifier;
use witness_core::layout::{OS_BLOCK, firmware_offset};
use witness_core::provision::flash_jobs;

/// Release plus an image holding its installed firmware.
fn provisioned() -> (Release, FirmwareSet) {
    let release = Release::new();
    let firmware = FirmwareSet::fetch(&release.config.bundle_fetcher()).unwrap();
    std::fs::File::create(release.image_path()).unwrap();
    MmcFlasher::new()
        .flash(&release.image_path(), &flash_jobs(&firmware, false).unwrap())
        .unwrap();
    (release, firmware)
}

fn verifier(release: &Release) -> DeviceVerifier<SimulatedDevice, witness_core::events::TracingObserver> {
    let config = &release.config;
    DeviceVerifier::new(
        config.verifier_set().unwrap(),
        config.log_tracker().unwrap(),
        &config.log.state_file,
        SimulatedDevice::reopen(&release.image_path()),
    )
}

#[test]
fn test_log_grew_since_release() {
    let (mut release, firmware) = provisioned();
    release.grow_log(10);

    let mut verifier = verifier(&release);
    let reports = verifier.verify_device(&firmware.recovery).unwrap();

    assert!(reports.iter().all(|r| r.passed()));
    assert!(reports.iter().all(|r| r.checkpoint_size == Some(4)));
    assert_eq!(verifier.tracker().latest().size, 14);
}

#[test]
fn test_trusted_state_advances_over_consistent_growth() {
    let (mut release, firmware) = provisioned();
    verifier(&release).verify_device(&firmware.recovery).unwrap();
    let saved = std::fs::read(&release.config.log.state_file).unwrap();

    release.grow_log(6);
    // a refresh adopts the larger tree once it proves consistent
    let mut tracker = release.config.log_tracker().unwrap();
    assert_eq!(tracker.latest().size, 4);
    assert!(tracker.update().unwrap());
    assert_eq!(tracker.latest().size, 10);
    assert_eq!(std::fs::read(&release.config.log.state_file).unwrap(), saved);
}

#[test]
fn test_forked_log_rejected() {
    let (mut release, firmware) = provisioned();
    release.fork_log(8);

    let mut verifier = verifier(&release);
    let err = verifier.verify_device(&firmware.recovery).unwrap_err();

    assert!(format!("{err:#}").contains("not consistent with the log"));
    // nothing learned from a forked log is persisted
    assert!(!release.config.log.state_file.exists());
}

#[test]
fn test_forked_log_rejected_by_trusted_state() {
    let (mut release, firmware) = provisioned();
    verifier(&release).verify_device(&firmware.recovery).unwrap();

    release.fork_log(8);
    let mut tracker = release.config.log_tracker().unwrap();
    assert!(tracker.update().is_err());
    assert_eq!(tracker.latest().size, 4);
}

#[test]
fn test_modified_firmware_reported() {
    let (release, firmware) = provisioned();
    let mut image = OpenOptions::new().write(true).open(release.image_path()).unwrap();
    image.seek(SeekFrom::Start(firmware_offset(OS_BLOCK) + 17)).unwrap();
    image.write_all(&[!firmware.os.firmware[17]]).unwrap();
    drop(image);

    let err = verifier(&release).verify_device(&firmware.recovery).unwrap_err();
    let msg = format!("{err:#}");
    assert!(msg.contains("trusted OS"));
    assert!(!msg.contains("trusted applet:"));
}

#[test]
fn test_recovery_descriptor_must_verify() {
    let (release, _) = provisioned();
    let mut recovery = release.config.bundle_fetcher().fetch(Component::Recovery).unwrap();
    recovery.manifest = recovery.manifest.to_ascii_uppercase();

    let err = verifier(&release).verify_device(&recovery).unwrap_err();
    assert!(format!("{err:#}").contains("Recovery image failed verification"));
}
