//! Witness-Core: provisioning and firmware-transparency verification for
//! i.MX6ULL based witness appliances.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Layout**: MMC block map and the config block codec
//! - **Protocol**: SDP commands, IVT/DCD parsing, U2FHID framing, status decoding
//! - **Transport**: HID report abstraction (nusb, mock)
//! - **SDP**: serial download of a boot image into the recovery persona
//! - **Detect**: waiting for the recovery, mass-storage and operational personas
//! - **Flash**: writing ordered jobs to the raw MMC block device
//! - **Log**: notes, checkpoints, Merkle proofs and the log state tracker
//! - **Verify**: proof bundle verification
//! - **Provision**: the provisioning state machine, including the fuse gate
//! - **Inspect**: re-verifying the firmware installed on a device
//! - **Events**: observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use witness_core::config::ProvisionConfig;
//!
//! let config = ProvisionConfig::load_from_file("witness.toml").expect("bad config");
//! println!("log origin: {}", config.log.origin);
//! ```

pub mod bundle;
pub mod config;
pub mod detect;
pub mod events;
pub mod flash;
pub mod inspect;
pub mod layout;
pub mod log;
pub mod protocol;
pub mod provision;
pub mod sdp;
pub mod transport;
pub mod verify;

// Re-exports for convenience
pub use bundle::{BundleFetcher, Component, DirectoryBundleFetcher, FirmwareBundle, FirmwareSet};
pub use config::ProvisionConfig;
pub use events::{LogLevel, NullObserver, Persona, ProvisionEvent, ProvisionObserver, TracingObserver};
pub use flash::{FlashError, FlashJob, MmcFlasher};
pub use layout::{ConfigBlock, ConfigError, ProofBundle};
pub use inspect::DeviceVerifier;
pub use provision::{DeviceBackend, OperationalDevice, ProvisionReport, ProvisionSession, ProvisionState, UsbBackend};
pub use sdp::{SdpError, SdpTarget};
pub use transport::{HidTransport, MockHidTransport, NusbEnumerator, TransportError, UsbEnumerator};
pub use verify::{BundleVerifier, VerifyError};
