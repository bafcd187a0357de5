//! Subcommand implementations.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, ValueEnum};
use serde_json::json;
use tracing::{info, warn};
use witness_core::bundle::{BundleDescriptor, BundleFetcher, Component, FirmwareBundle, FirmwareSet};
use witness_core::config::ProvisionConfig;
use witness_core::inspect::{DeviceVerifier, INSTALLED};
use witness_core::layout::{
    APPLET_BLOCK, CONFIG_MAX_LENGTH, ConfigBlock, OS_BLOCK, block_offset, bootloader_config, config_block,
};
use witness_core::provision::backend::read_block_device;
use witness_core::provision::{ProvisionSession, UsbBackend};

/// Device discovery overrides shared by the device commands.
#[derive(Args, Debug)]
pub struct DeviceArgs {
    /// Glob for block devices the recovery firmware may appear as
    #[arg(long = "blockdevs")]
    block_device_glob: Option<String>,

    /// Give up waiting for a device after this many seconds
    #[arg(long)]
    wait_timeout: Option<u64>,
}

impl DeviceArgs {
    fn apply(&self, config: &mut ProvisionConfig) {
        if let Some(glob) = &self.block_device_glob {
            config.device.block_device_glob = glob.clone();
        }
        if self.wait_timeout.is_some() {
            config.options.wait_timeout_secs = self.wait_timeout;
        }
    }
}

#[derive(Args, Debug)]
pub struct ProvisionArgs {
    #[command(flatten)]
    device: DeviceArgs,

    /// Irreversibly enable HAB secure boot
    #[arg(long)]
    fuse: bool,

    /// SRK hash the device must report before fusing (hex)
    #[arg(long)]
    expected_srk_hash: Option<String>,

    /// Continue past failed safety checks
    #[arg(long)]
    override_safety: bool,

    /// Zero the applet data region after flashing
    #[arg(long)]
    wipe_applet_data: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ComponentArg {
    Bootloader,
    Os,
    Applet,
}

impl From<ComponentArg> for Component {
    fn from(c: ComponentArg) -> Self {
        match c {
            ComponentArg::Bootloader => Component::Bootloader,
            ComponentArg::Os => Component::TrustedOs,
            ComponentArg::Applet => Component::TrustedApplet,
        }
    }
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Component the config block is for
    #[arg(long, value_enum)]
    component: ComponentArg,

    /// Bundle descriptor (defaults to the one in the configuration file)
    #[arg(long)]
    bundle: Option<PathBuf>,

    /// File to write the encoded config block to
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Image file or block device
    path: PathBuf,

    /// Config block to decode, e.g. 0x5000 (defaults to every installed component)
    #[arg(long, value_parser = parse_block)]
    block: Option<u64>,

    /// Also read the firmware each block points at and print its digest
    #[arg(long)]
    firmware: bool,
}

fn parse_block(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid block number {s:?}: {e}"))
}

fn load_config(path: &Path) -> Result<ProvisionConfig> {
    info!(path = %path.display(), "Loading configuration");
    ProvisionConfig::load_from_file(path)
}

pub fn provision(config_path: &Path, args: ProvisionArgs) -> Result<()> {
    let mut config = load_config(config_path)?;
    args.device.apply(&mut config);
    config.options.fuse |= args.fuse;
    config.options.override_safety |= args.override_safety;
    config.options.wipe_applet_data |= args.wipe_applet_data;
    if args.expected_srk_hash.is_some() {
        config.options.expected_srk_hash = args.expected_srk_hash;
    }
    config.validate()?;

    let firmware = FirmwareSet::fetch(&config.bundle_fetcher()).context("Failed to fetch firmware bundles")?;
    let verifiers = config.verifier_set()?;
    let tracker = config.log_tracker()?;
    let backend = UsbBackend::new(config.device.clone());

    let mut session = ProvisionSession::new(config, firmware, verifiers, tracker, backend);
    let report = session.run()?;

    for warning in &report.warnings {
        warn!("{}", warning);
    }
    info!(
        serial = %report.status.serial,
        identity = %report.status.identity,
        fused = report.fused,
        "Device provisioned"
    );
    Ok(())
}

pub fn verify(config_path: &Path, args: DeviceArgs) -> Result<()> {
    let mut config = load_config(config_path)?;
    args.apply(&mut config);
    config.validate()?;

    let recovery = config
        .bundle_fetcher()
        .fetch(Component::Recovery)
        .context("Failed to fetch recovery bundle")?;
    let backend = UsbBackend::new(config.device.clone());
    let mut verifier = DeviceVerifier::new(
        config.verifier_set()?,
        config.log_tracker()?,
        config.log.state_file.clone(),
        backend,
    )
    .with_wait_timeout(config.wait_timeout());

    let reports = verifier.verify_device(&recovery)?;
    println!("{}", serde_json::to_string_pretty(&reports)?);
    info!("Device verified OK");
    Ok(())
}

pub fn config(config_path: &Path, args: ConfigArgs) -> Result<()> {
    let config = load_config(config_path)?;
    let component = Component::from(args.component);
    let bundle: FirmwareBundle = match &args.bundle {
        Some(path) => BundleDescriptor::load(path)?,
        None => config.bundle_fetcher().fetch(component)?,
    };

    let verified = config
        .verifier_set()?
        .get(component)
        .verify_self_consistency(&bundle)
        .with_context(|| format!("{component} bundle failed verification"))?;
    info!(
        tag = %verified.release.git_tag_name,
        index = bundle.log_index,
        checkpoint = verified.checkpoint.size,
        "Bundle verified"
    );

    let encoded = match component {
        Component::Bootloader => bootloader_config(&bundle)?,
        Component::TrustedOs => config_block(&bundle, OS_BLOCK).encode()?,
        Component::TrustedApplet => config_block(&bundle, APPLET_BLOCK).encode()?,
        Component::Recovery => bail!("The recovery image is not stored on MMC"),
    };
    std::fs::write(&args.output, &encoded)
        .with_context(|| format!("Failed to write {}", args.output.display()))?;
    info!(
        bytes = encoded.len(),
        path = %args.output.display(),
        "Wrote config block"
    );
    Ok(())
}

pub fn inspect(args: InspectArgs) -> Result<()> {
    let blocks: Vec<u64> = match args.block {
        Some(block) => vec![block],
        None => INSTALLED.iter().map(|(_, block)| *block).collect(),
    };

    let mut out = Vec::with_capacity(blocks.len());
    for block in blocks {
        let raw = read_block_device(&args.path, block_offset(block), CONFIG_MAX_LENGTH)?;
        let config =
            ConfigBlock::decode(&raw).with_context(|| format!("Failed to decode config at block 0x{block:X}"))?;

        let mut entry = json!({
            "block": format!("0x{block:X}"),
            "offset": format!("0x{:X}", config.offset),
            "size": config.size,
            "log_index": config.bundle.log_index,
            "checkpoint": String::from_utf8_lossy(&config.bundle.checkpoint),
            "manifest": String::from_utf8_lossy(&config.bundle.manifest),
            "inclusion_proof": config.bundle.inclusion_proof.iter().map(hex::encode).collect::<Vec<_>>(),
        });
        if args.firmware {
            let size = usize::try_from(config.size)?;
            let firmware = read_block_device(&args.path, config.offset, size)?;
            let bundle = FirmwareBundle::from_parts(firmware, config.bundle);
            entry["firmware_sha256"] = json!(hex::encode(bundle.firmware_digest()));
        }
        out.push(entry);
    }

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_block() {
        assert_eq!(parse_block("0x5000"), Ok(0x5000));
        assert_eq!(parse_block("0X4FB0"), Ok(0x4FB0));
        assert_eq!(parse_block("2"), Ok(2));
        assert!(parse_block("0xZZ").is_err());
    }
}
