use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build,
    /// Run the test suite
    Test,
    /// Provision a device with the CLI
    Provision {
        /// Configuration file
        #[arg(long, default_value = "witness.toml")]
        config: String,
        /// Extra arguments for `witness provision`
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Verify a device with the CLI
    Verify {
        /// Configuration file
        #[arg(long, default_value = "witness.toml")]
        config: String,
    },
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{what} failed");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building project...");
            cargo(&["build"], "Build")?;
        }
        Commands::Test => {
            println!("Running tests...");
            cargo(&["test", "--workspace"], "Test")?;
        }
        Commands::Provision { config, args } => {
            println!("Provisioning device...");
            let mut cmd = vec!["run", "-p", "witness-cli", "--", "--config", config.as_str(), "provision"];
            cmd.extend(args.iter().map(String::as_str));
            cargo(&cmd, "Provision")?;
        }
        Commands::Verify { config } => {
            println!("Verifying device...");
            cargo(
                &["run", "-p", "witness-cli", "--", "--config", config.as_str(), "verify"],
                "Verify",
            )?;
        }
    }

    Ok(())
}
