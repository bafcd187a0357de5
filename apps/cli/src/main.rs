use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};

mod commands;

#[derive(Parser, Debug)]
#[command(author, version, about = "Witness appliance provisioning and verification tool", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, default_value = "witness.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Flash a device with verified firmware, optionally fusing it
    Provision(commands::ProvisionArgs),
    /// Verify the firmware installed on a device
    Verify(commands::DeviceArgs),
    /// Write the encoded config block for a firmware bundle
    Config(commands::ConfigArgs),
    /// Decode a config block from an image file or block device
    Inspect(commands::InspectArgs),
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting witness tool (nusb backend)...");

    let result = match args.command {
        Command::Provision(cmd) => commands::provision(&args.config, cmd),
        Command::Verify(cmd) => commands::verify(&args.config, cmd),
        Command::Config(cmd) => commands::config(&args.config, cmd),
        Command::Inspect(cmd) => commands::inspect(cmd),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
